use crate::error::{GuardrailError, GuardrailResult};

#[test]
fn test_io_error_conversion() {
    fn read_missing() -> GuardrailResult<String> {
        let contents = std::fs::read_to_string("/definitely/not/a/real/path.toml")?;
        Ok(contents)
    }

    match read_missing() {
        Err(GuardrailError::IoError(_)) => {}
        other => panic!("Expected IoError, got {:?}", other),
    }
}

#[test]
fn test_json_error_conversion() {
    fn parse() -> GuardrailResult<serde_json::Value> {
        Ok(serde_json::from_str("{not json")?)
    }

    let err = parse().unwrap_err();
    assert!(matches!(err, GuardrailError::Serialization { .. }));
    assert!(err.to_string().contains("json"));
}

#[test]
fn test_configuration_display() {
    let err = GuardrailError::configuration("client.timeout", "must be positive");
    assert_eq!(
        err.to_string(),
        "Configuration error in client.timeout: must be positive"
    );
}

#[test]
fn test_storage_source_chain() {
    use std::error::Error;

    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
    let err = GuardrailError::storage("save breadcrumbs", io);
    assert!(err.source().is_some());
    assert!(err.to_string().contains("save breadcrumbs"));
}
