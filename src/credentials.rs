use std::{fmt, path::Path};

use hmac::{Hmac, Mac};
use sha2::Sha384;

use crate::errors::StreamError;

/// API key pair. The key file format is two plaintext lines: key, then secret.
#[derive(Clone)]
pub struct Credentials {
    key: String,
    secret: String,
}

impl Credentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Result<Self, StreamError> {
        let key = key.into().trim().to_string();
        let secret = secret.into().trim().to_string();
        if key.is_empty() || secret.is_empty() {
            return Err(StreamError::Credentials(
                "key and secret must be non-empty".to_string(),
            ));
        }
        Ok(Self { key, secret })
    }

    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            StreamError::Credentials(format!("unable to read {}: {err}", path.display()))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, StreamError> {
        let mut lines = contents.lines().map(str::trim).filter(|line| !line.is_empty());
        let (Some(key), Some(secret)) = (lines.next(), lines.next()) else {
            return Err(StreamError::Credentials(
                "key file must contain the key and the secret on separate lines".to_string(),
            ));
        };
        Self::new(key, secret)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Hex HMAC-SHA384 of `payload` keyed with the secret.
    pub fn sign_sha384(&self, payload: &str) -> Result<String, StreamError> {
        let mut mac = Hmac::<Sha384>::new_from_slice(self.secret.as_bytes())
            .map_err(|err| StreamError::Credentials(err.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_two_line_key_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should open");
        writeln!(file, "my-key\n  my-secret  \n").expect("key file should write");

        let credentials = Credentials::from_key_file(file.path()).expect("key file should parse");
        assert_eq!(credentials.key(), "my-key");
        assert!(!format!("{credentials:?}").contains("my-secret"));
    }

    #[test]
    fn rejects_single_line_and_missing_files() {
        assert!(matches!(
            Credentials::parse("only-a-key"),
            Err(StreamError::Credentials(_))
        ));
        assert!(Credentials::from_key_file("/nonexistent/feed.key").is_err());
    }

    #[test]
    fn signs_with_hmac_sha384() {
        let credentials = Credentials::new("key", "secret").expect("credentials should build");
        let signature = credentials
            .sign_sha384("AUTH1700000000000")
            .expect("signature should compute");

        assert_eq!(signature.len(), 96);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            signature,
            credentials
                .sign_sha384("AUTH1700000000000")
                .expect("signature should compute")
        );
    }
}
