use chrono::NaiveDateTime;

/// Which timer initiated an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Fixed interval ticker
    Periodic,
    /// Fires just after local midnight; the batch belongs to the day that ended
    Midnight,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Periodic => "periodic",
            TriggerKind::Midnight => "midnight",
        }
    }
}

/// Derives remote object keys and content types
#[derive(Debug, Clone)]
pub struct ObjectNamer {
    prefix: String,
    compression: bool,
}

impl ObjectNamer {
    pub fn new(prefix: impl Into<String>, compression: bool) -> Self {
        Self {
            prefix: prefix.into(),
            compression,
        }
    }

    /// Generate the object key for an upload at local time `now`.
    /// Format: {prefix}/{YYYY-MM-DD}/{YYYYMMDDHHMMSS}[.gz]
    ///
    /// Midnight uploads are dated one day earlier than `now`.
    pub fn object_key(&self, now: NaiveDateTime, trigger: TriggerKind) -> String {
        let timestamp = now.format("%Y%m%d%H%M%S");
        let day = match trigger {
            TriggerKind::Periodic => now.date(),
            TriggerKind::Midnight => now.date().pred_opt().unwrap_or(now.date()),
        };

        format!(
            "{prefix}/{date}/{timestamp}{ext}",
            prefix = self.prefix,
            date = day.format("%Y-%m-%d"),
            timestamp = timestamp,
            ext = self.extension()
        )
    }

    pub fn extension(&self) -> &'static str {
        if self.compression {
            ".gz"
        } else {
            ""
        }
    }

    pub fn content_type(&self) -> &'static str {
        if self.compression {
            "multipart/x-gzip"
        } else {
            "text/plain"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_compressed_key_shape() {
        let namer = ObjectNamer::new("logs", true);
        let key = namer.object_key(at(2024, 3, 1, 12, 30, 0), TriggerKind::Periodic);

        assert_eq!(key, "logs/2024-03-01/20240301123000.gz");
        assert_eq!(namer.content_type(), "multipart/x-gzip");
    }

    #[test]
    fn test_uncompressed_key_shape() {
        let namer = ObjectNamer::new("app/web", false);
        let key = namer.object_key(at(2024, 1, 15, 8, 5, 9), TriggerKind::Periodic);

        assert_eq!(key, "app/web/2024-01-15/20240115080509");
        assert_eq!(namer.content_type(), "text/plain");
    }

    #[test]
    fn test_midnight_attributes_previous_day() {
        let namer = ObjectNamer::new("logs", true);
        let now = at(2024, 3, 1, 0, 0, 5);

        let midnight = namer.object_key(now, TriggerKind::Midnight);
        let periodic = namer.object_key(now, TriggerKind::Periodic);

        // 2024 is a leap year
        assert_eq!(midnight, "logs/2024-02-29/20240301000005.gz");
        assert_eq!(periodic, "logs/2024-03-01/20240301000005.gz");
    }

    #[test]
    fn test_midnight_across_year_boundary() {
        let namer = ObjectNamer::new("logs", false);
        let key = namer.object_key(at(2025, 1, 1, 0, 0, 1), TriggerKind::Midnight);

        assert_eq!(key, "logs/2024-12-31/20250101000001");
    }
}
