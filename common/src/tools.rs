use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::{Rng, distr::Alphanumeric};

/// Random alphanumeric string, used for generated credentials
pub fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn encode_base64(data: &str) -> String {
    STANDARD.encode(data)
}
