/*!
Tests for error types, classification and message formatting.
*/

#[cfg(test)]
mod tests {
    use crate::checksum::Checksum;
    use crate::error::DraftError;
    use drafthold_retry::RetryableError;
    use std::error::Error;
    use std::io;

    #[test]
    fn test_draft_error_display() {
        let error = DraftError::validation("component 0 (?): missing id");
        assert_eq!(
            error.to_string(),
            "Validation error: component 0 (?): missing id"
        );

        let error = DraftError::storage("disk unplugged");
        assert_eq!(error.to_string(), "Storage error: disk unplugged");

        let error = DraftError::quota_exceeded("diagram-d1");
        assert_eq!(
            error.to_string(),
            "Storage quota exceeded while writing 'diagram-d1'"
        );
    }

    #[test]
    fn test_from_io_and_json_errors() {
        let error = DraftError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(error, DraftError::Io(_)));

        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = DraftError::from(json_error);
        assert!(matches!(error, DraftError::Json(_)));
        assert!(error.is_corruption());
    }

    #[test]
    fn test_integrity_check_failed_names_both_checksums() {
        let error = DraftError::IntegrityCheckFailed {
            expected: Checksum::from_raw(0xabc123),
            actual: Checksum::from_raw(0xdef456),
        };

        assert!(error.to_string().contains("00abc123"));
        assert!(error.to_string().contains("00def456"));
        assert!(error.is_corruption());
    }

    #[test]
    fn test_transient_classification() {
        assert!(DraftError::storage("timeout").is_transient());
        assert!(DraftError::quota_exceeded("k").is_transient());
        assert!(DraftError::from(io::Error::other("eio")).is_transient());

        assert!(DraftError::validation("bad").is_permanent());
        assert!(DraftError::corruption("torn").is_permanent());
        assert!(DraftError::config("bad").is_permanent());
    }

    #[test]
    fn test_save_failed_keeps_source() {
        let error = DraftError::SaveFailed {
            attempts: 4,
            source: Box::new(DraftError::storage("disk unplugged")),
        };

        assert_eq!(
            error.to_string(),
            "Save failed after 4 attempts: Storage error: disk unplugged"
        );
        let source = error.source().unwrap();
        assert_eq!(source.to_string(), "Storage error: disk unplugged");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<DraftError>();
        assert_sync::<DraftError>();
    }
}
