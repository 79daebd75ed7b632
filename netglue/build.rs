use tonic_build::manual::{Builder, Method, Service};

fn main() {
    let method = |name: &str, route: &str, input: &str, output: &str| {
        Method::builder()
            .name(name)
            .route_name(route)
            .input_type(format!("crate::api::{input}"))
            .output_type(format!("crate::api::{output}"))
            .codec_path("tonic::codec::ProstCodec")
            .build()
    };

    let service = Service::builder()
        .name("ProxyService")
        .package("platformd.proxy.v1alpha1")
        .method(method(
            "create_listeners",
            "CreateListeners",
            "CreateListenersRequest",
            "CreateListenersResponse",
        ))
        .method(method(
            "delete_listeners",
            "DeleteListeners",
            "DeleteListenersRequest",
            "DeleteListenersResponse",
        ))
        .build();

    Builder::new().compile(&[service]);
}
