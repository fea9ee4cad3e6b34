use precompute_core::{CodecKey, KernelError, KeyProvider};
use zeroize::Zeroize;

/// Environment variable holding the hex-encoded codec key.
pub const CODEC_KEY_ENV: &str = "PRECOMPUTE_CODEC_KEY";

/// Reads codec keys from the environment on every request, so a rotated key
/// is picked up without a restart.
///
/// `PRECOMPUTE_CODEC_KEY_<KEY_ID>` wins over the shared `PRECOMPUTE_CODEC_KEY`.
#[derive(Debug, Clone)]
pub struct EnvKeyProvider {
    var: String,
}

impl Default for EnvKeyProvider {
    fn default() -> Self {
        Self::new(CODEC_KEY_ENV)
    }
}

impl EnvKeyProvider {
    #[must_use]
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    fn scoped_var(&self, key_id: &str) -> String {
        let suffix: String = key_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}_{suffix}", self.var)
    }
}

impl KeyProvider for EnvKeyProvider {
    fn decryption_key(&self, key_id: &str) -> Result<CodecKey, KernelError> {
        let mut encoded = std::env::var(self.scoped_var(key_id))
            .or_else(|_| std::env::var(&self.var))
            .map_err(|_| KernelError::KeyUnavailable(key_id.to_string()))?;
        let key = CodecKey::from_hex(encoded.trim());
        encoded.zeroize();
        key.map_err(|_| KernelError::KeyUnavailable(key_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_variable_names_are_uppercased() {
        let provider = EnvKeyProvider::new("PC_TEST_KEY");
        assert_eq!(provider.scoped_var("primary"), "PC_TEST_KEY_PRIMARY");
        assert_eq!(provider.scoped_var("2024-q3"), "PC_TEST_KEY_2024_Q3");
    }

    #[test]
    fn missing_variables_fail_closed() {
        let provider = EnvKeyProvider::new("PC_TEST_KEY_THAT_IS_NEVER_SET");
        assert_eq!(
            provider.decryption_key("primary").err(),
            Some(KernelError::KeyUnavailable("primary".to_string()))
        );
    }
}
