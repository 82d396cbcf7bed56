use thiserror::Error;

/// Errors that can occur while encoding a record
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid JSON record: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Record rejected: {0}")]
    Rejected(String),
}

/// Turns an inbound record into the bytes that get buffered.
///
/// An empty payload means "nothing to write" and is skipped by the pipeline.
pub trait Encoder<R>: Send + Sync {
    fn encode(&self, record: &R) -> Result<Vec<u8>, EncodeError>;
}

/// Writes each record followed by a newline
#[derive(Debug, Clone, Copy, Default)]
pub struct LineEncoder;

impl<R: AsRef<str>> Encoder<R> for LineEncoder {
    fn encode(&self, record: &R) -> Result<Vec<u8>, EncodeError> {
        let line = record.as_ref();
        if line.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(line.len() + 1);
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
        Ok(out)
    }
}

/// Validates each record as JSON and writes it compact, one per line
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineEncoder;

impl<R: AsRef<str>> Encoder<R> for JsonLineEncoder {
    fn encode(&self, record: &R) -> Result<Vec<u8>, EncodeError> {
        let text = record.as_ref().trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = serde_json::from_str(text)?;
        let mut out = serde_json::to_vec(&value)?;
        out.push(b'\n');
        Ok(out)
    }
}

impl<R, F> Encoder<R> for F
where
    F: Fn(&R) -> Result<Vec<u8>, EncodeError> + Send + Sync,
{
    fn encode(&self, record: &R) -> Result<Vec<u8>, EncodeError> {
        self(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_encoder_appends_newline() {
        let bytes = LineEncoder.encode(&"GET /index.html 200").unwrap();
        assert_eq!(bytes, b"GET /index.html 200\n");
    }

    #[test]
    fn test_line_encoder_skips_empty() {
        assert!(LineEncoder.encode(&String::new()).unwrap().is_empty());
    }

    #[test]
    fn test_json_encoder_compacts() {
        let bytes = JsonLineEncoder
            .encode(&r#"{ "level": "info",  "msg": "started" }"#)
            .unwrap();
        assert_eq!(bytes, b"{\"level\":\"info\",\"msg\":\"started\"}\n");
    }

    #[test]
    fn test_json_encoder_rejects_garbage() {
        let err = JsonLineEncoder.encode(&"{not json").unwrap_err();
        assert!(matches!(err, EncodeError::InvalidJson(_)));
    }

    #[test]
    fn test_closure_encoder() {
        let upper = |record: &String| -> Result<Vec<u8>, EncodeError> {
            if record == "drop" {
                return Err(EncodeError::Rejected(record.clone()));
            }
            Ok(record.to_uppercase().into_bytes())
        };

        assert_eq!(upper.encode(&"abc".to_string()).unwrap(), b"ABC");
        assert!(upper.encode(&"drop".to_string()).is_err());
    }
}
