use super::Error;

/// `CNI_ARGS` key carrying the workload id.
pub const WORKLOAD_ID_KEY: &str = "K8S_POD_UID";

/// Parses `;` separated `KEY=VALUE` pairs. Every pair must split into exactly
/// one non-empty key and one non-empty value.
pub fn parse(args: &str) -> Result<Vec<(String, String)>, Error> {
    args.split(';')
        .map(|pair| {
            let mut parts = pair.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) if !key.is_empty() && !value.is_empty() => {
                    Ok((key.to_string(), value.to_string()))
                }
                _ => Err(Error::MalformedArgs(pair.to_string())),
            }
        })
        .collect()
}

pub fn workload_id(args: &str) -> Result<String, Error> {
    parse(args)?
        .into_iter()
        .find_map(|(key, value)| (key == WORKLOAD_ID_KEY).then_some(value))
        .ok_or(Error::WorkloadIdMissing)
}
