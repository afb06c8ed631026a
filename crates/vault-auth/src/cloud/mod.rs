//! Cloud workload identities exchanged for vault tokens
//!
//! Each provider produces the grant for its method: a signed STS request
//! for AWS, a management-plane bearer token for Azure, and an identity JWT
//! for GCP.

pub mod aws;
pub mod azure;
pub mod gcp;

/// Minimal query-value encoding for audiences and resource URLs.
pub(crate) fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
