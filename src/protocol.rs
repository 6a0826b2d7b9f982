/// Wire envelopes for the external message channel. Generalizes
/// `web_server.rs`'s `ClientMessage`/`ServerMessage` tagged enums (which only
/// covered subscribe/unsubscribe/ping) to the full action set: session
/// binding, historical+live data requests, timeframe changes, and replay
/// control.
use crate::model::Bar;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionSpec {
    pub instrument: String,
    pub timeframe: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action")]
#[serde(rename_all = "snake_case")]
pub enum ClientRequest {
    SetClientId {
        clientid: String,
    },
    GetData {
        subscriptions: Vec<SubscriptionSpec>,
        start_time: Option<String>,
        end_time: Option<String>,
        #[serde(default)]
        live_data: LiveData,
        #[serde(default = "default_sendto")]
        sendto: String,
        #[serde(default = "default_true")]
        use_cache: bool,
        #[serde(default = "default_true")]
        save_cache: bool,
        timezone: Option<String>,
    },
    AddTimeframe {
        instrument: String,
        timeframe: String,
    },
    RemoveTimeframe {
        instrument: String,
        timeframe: String,
    },
    StopData {},
    GetReplay {
        subscriptions: Vec<SubscriptionSpec>,
        history_start: HistoryStart,
        live_start: LiveStart,
        live_end: LiveEnd,
        replay_interval: u64,
    },
    ModifyReplay {
        pause: Option<bool>,
        replay_interval: Option<u64>,
    },
    StopReplay {},
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveData {
    #[default]
    None,
    All,
    Seconds(u64),
}

fn default_sendto() -> String {
    "channel".to_string()
}

fn default_true() -> bool {
    true
}

/// `history_start`: a negative number means "minutes back from now"; anything
/// else is an ISO timestamp string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HistoryStart {
    MinutesBack(i64),
    Iso(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LiveStart {
    Current(CurrentMarker),
    Iso(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentMarker {
    Current,
}

/// `live_end`: `"none"`, `"all"`, an ISO timestamp, a numeric epoch-ms
/// timestamp (when > 10^8), or a numeric seconds-to-play otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LiveEnd {
    None_(NoneMarker),
    All(AllMarker),
    Iso(String),
    Numeric(f64),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoneMarker {
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllMarker {
    All,
}

impl LiveEnd {
    /// Splits the numeric case into epoch-ms timestamp vs seconds-to-play,
    /// per the `> 10^8` threshold in the request envelope's semantics.
    pub fn resolve_numeric(value: f64) -> NumericLiveEnd {
        if value > 1e8 {
            NumericLiveEnd::Timestamp(value as i64)
        } else {
            NumericLiveEnd::SecondsToPlay(value as i64)
        }
    }

    /// Resolves to an epoch-ms bound, or `i64::MAX` for `"none"`/`"all"`
    /// (open-ended; the replay loop runs until the series is exhausted).
    pub fn resolve(&self, now_ms: i64, live_start_ms: i64) -> i64 {
        match self {
            LiveEnd::None_(_) | LiveEnd::All(_) => i64::MAX,
            LiveEnd::Iso(s) => parse_iso_ms(s).unwrap_or(now_ms),
            LiveEnd::Numeric(v) => match Self::resolve_numeric(*v) {
                NumericLiveEnd::Timestamp(ts) => ts,
                NumericLiveEnd::SecondsToPlay(secs) => live_start_ms + secs * 1000,
            },
        }
    }
}

impl HistoryStart {
    /// A negative `MinutesBack` offsets before `now_ms`; anything else is
    /// parsed as an RFC3339 timestamp.
    pub fn resolve(&self, now_ms: i64) -> i64 {
        match self {
            HistoryStart::MinutesBack(minutes) => now_ms + minutes * 60_000,
            HistoryStart::Iso(s) => parse_iso_ms(s).unwrap_or(now_ms),
        }
    }
}

impl LiveStart {
    pub fn resolve(&self, now_ms: i64) -> i64 {
        match self {
            LiveStart::Current(_) => now_ms,
            LiveStart::Iso(s) => parse_iso_ms(s).unwrap_or(now_ms),
        }
    }
}

/// Resolves `get_data`'s `start_time`/`end_time` strings into epoch-ms
/// bounds: an absent or `"current"` end resolves to `now`; an absent start
/// defaults to 60 days before `now`; any other value is parsed as RFC3339.
pub fn resolve_get_data_range(
    start_time: Option<&str>,
    end_time: Option<&str>,
    now_ms: i64,
) -> (i64, i64) {
    const SIXTY_DAYS_MS: i64 = 60 * 24 * 3_600_000;

    let end = match end_time {
        None => now_ms,
        Some(s) if s.eq_ignore_ascii_case("current") => now_ms,
        Some(s) => parse_iso_ms(s).unwrap_or(now_ms),
    };
    let start = match start_time {
        None => now_ms - SIXTY_DAYS_MS,
        Some(s) if s.eq_ignore_ascii_case("current") => now_ms,
        Some(s) => parse_iso_ms(s).unwrap_or(now_ms - SIXTY_DAYS_MS),
    };
    (start, end)
}

fn parse_iso_ms(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericLiveEnd {
    Timestamp(i64),
    SecondsToPlay(i64),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mtyp")]
#[serde(rename_all = "lowercase")]
pub enum ServerMessage {
    Data {
        #[serde(flatten)]
        bar: BarWire,
    },
    Ctrl {
        #[serde(flatten)]
        body: serde_json::Value,
    },
    Error {
        message: String,
    },
    Strategy {
        action: String,
        #[serde(flatten)]
        body: serde_json::Value,
    },
}

/// `Bar` plus the human-readable `dateTime` field attached per the
/// requested timezone.
#[derive(Debug, Clone, Serialize)]
pub struct BarWire {
    #[serde(flatten)]
    pub bar: Bar,
    #[serde(rename = "dateTime")]
    pub date_time: String,
}

pub fn render_date_time(timestamp_ms: i64, tz: &chrono_tz::Tz) -> String {
    let utc = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_default();
    utc.with_timezone(tz).format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_data_request() {
        let json = r#"{"action":"get_data","subscriptions":[{"instrument":"ES","timeframe":"5m"}],"start_time":null,"end_time":"current"}"#;
        let parsed: ClientRequest = serde_json::from_str(json).unwrap();
        match parsed {
            ClientRequest::GetData {
                subscriptions,
                use_cache,
                save_cache,
                ..
            } => {
                assert_eq!(subscriptions.len(), 1);
                assert!(use_cache);
                assert!(save_cache);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn numeric_live_end_threshold() {
        assert_eq!(LiveEnd::resolve_numeric(30.0), NumericLiveEnd::SecondsToPlay(30));
        assert_eq!(
            LiveEnd::resolve_numeric(1_700_000_000_000.0),
            NumericLiveEnd::Timestamp(1_700_000_000_000)
        );
    }

    #[test]
    fn renders_date_time_in_requested_zone() {
        let s = render_date_time(0, &chrono_tz::UTC);
        assert_eq!(s, "1970-01-01 00:00:00");
    }

    #[test]
    fn get_data_range_defaults_to_sixty_days_back_and_now() {
        let now = 100 * 24 * 3_600_000i64;
        let (start, end) = resolve_get_data_range(None, None, now);
        assert_eq!(end, now);
        assert_eq!(start, now - 60 * 24 * 3_600_000);
    }

    #[test]
    fn get_data_range_parses_iso_strings() {
        let now = 0i64;
        let (start, end) = resolve_get_data_range(
            Some("2024-06-10T12:00:00+00:00"),
            Some("2024-06-11T12:00:00+00:00"),
            now,
        );
        assert_eq!(start, 1_718_020_800_000);
        assert_eq!(end, 1_718_107_200_000);
    }

    #[test]
    fn history_start_minutes_back_subtracts_from_now() {
        let resolved = HistoryStart::MinutesBack(-120).resolve(1_000_000);
        assert_eq!(resolved, 1_000_000 - 120 * 60_000);
    }

    #[test]
    fn live_end_none_and_all_are_open_ended() {
        assert_eq!(LiveEnd::None_(NoneMarker::None).resolve(0, 0), i64::MAX);
        assert_eq!(LiveEnd::All(AllMarker::All).resolve(0, 0), i64::MAX);
    }

    #[test]
    fn live_end_seconds_to_play_offsets_from_live_start() {
        let resolved = LiveEnd::Numeric(30.0).resolve(0, 1_000);
        assert_eq!(resolved, 1_000 + 30_000);
    }
}
