//! Immutable test campaign definitions.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::InvalidValue;

/// Which assets a test exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetScope {
    /// One asset per wireless link.
    Link,
    /// One asset per node, paired with its nearest POP.
    Node,
}

/// How the assets of a test are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Parallel,
    Sequential,
    Multihop,
}

/// Every supported test campaign type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestType {
    ParallelLink,
    ParallelNode,
    SequentialLink,
    SequentialNode,
    Multihop,
}

impl TestType {
    pub const ALL: [TestType; 5] = [
        TestType::ParallelLink,
        TestType::ParallelNode,
        TestType::SequentialLink,
        TestType::SequentialNode,
        TestType::Multihop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::ParallelLink => "PARALLEL_LINK",
            TestType::ParallelNode => "PARALLEL_NODE",
            TestType::SequentialLink => "SEQUENTIAL_LINK",
            TestType::SequentialNode => "SEQUENTIAL_NODE",
            TestType::Multihop => "MULTIHOP",
        }
    }

    pub fn scope(&self) -> AssetScope {
        match self {
            TestType::ParallelLink | TestType::SequentialLink => AssetScope::Link,
            TestType::ParallelNode | TestType::SequentialNode | TestType::Multihop => {
                AssetScope::Node
            }
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            TestType::ParallelLink | TestType::ParallelNode => Strategy::Parallel,
            TestType::SequentialLink | TestType::SequentialNode => Strategy::Sequential,
            TestType::Multihop => Strategy::Multihop,
        }
    }

    /// Type-specific option defaults: (session seconds, bitrate in bits/s).
    fn defaults(&self) -> (u64, u64) {
        match self.strategy() {
            Strategy::Parallel => (300, 100_000_000),
            Strategy::Sequential => (60, 200_000_000),
            Strategy::Multihop => (30, 100_000_000),
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TestType {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| InvalidValue::TestType(s.to_string()))
    }
}

impl ToSql for TestType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TestType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Lifecycle status shared by executions and per-session results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Running,
    Finished,
    Aborted,
    Failed,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Running => "RUNNING",
            TestStatus::Finished => "FINISHED",
            TestStatus::Aborted => "ABORTED",
            TestStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TestStatus::Running)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(TestStatus::Running),
            "FINISHED" => Ok(TestStatus::Finished),
            "ABORTED" => Ok(TestStatus::Aborted),
            "FAILED" => Ok(TestStatus::Failed),
            _ => Err(InvalidValue::TestStatus(s.to_string())),
        }
    }
}

impl ToSql for TestStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TestStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Traffic transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Traffic generator options, passed through to the control plane as-is.
///
/// Keys the orchestrator does not interpret are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
    /// Target bitrate in bits per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    /// Session duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_sec: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TrafficOptions {
    /// Fill every unset option with the defaults for `test_type`.
    pub fn with_defaults(mut self, test_type: TestType) -> Self {
        let (time_sec, bitrate) = test_type.defaults();
        self.protocol.get_or_insert(Protocol::Udp);
        self.json.get_or_insert(true);
        self.bitrate.get_or_insert(bitrate);
        self.time_sec.get_or_insert(time_sec);
        self
    }
}

/// Longest accepted session window, one day.
pub const MAX_TIME_SEC: u64 = 24 * 60 * 60;

/// An immutable description of a test campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub network_name: String,
    pub test_type: TestType,
    pub options: TrafficOptions,
    /// Asset names allowed to participate. `None` or empty means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<BTreeSet<String>>,
}

impl TestDefinition {
    pub fn new(
        network_name: impl Into<String>,
        test_type: TestType,
        options: TrafficOptions,
        allow_list: Option<BTreeSet<String>>,
    ) -> Self {
        Self {
            network_name: network_name.into(),
            test_type,
            options: options.with_defaults(test_type),
            allow_list: allow_list.filter(|list| !list.is_empty()),
        }
    }

    /// Reject session windows the control plane could never honor.
    pub fn validate(&self) -> Result<(), InvalidValue> {
        match self.options.time_sec {
            Some(secs) if secs == 0 || secs > MAX_TIME_SEC => Err(InvalidValue::TimeSec(secs)),
            _ => Ok(()),
        }
    }

    /// Duration of a single traffic session.
    pub fn session_duration(&self) -> Duration {
        let secs = self
            .options
            .time_sec
            .unwrap_or_else(|| self.test_type.defaults().0);
        Duration::from_secs(secs)
    }

    /// Expected wall-clock runtime for `asset_count` resolved assets.
    ///
    /// Parallel runs every session at once; sequential and multihop chain
    /// one session window per asset (per hop for multihop).
    pub fn estimate_duration(&self, asset_count: usize) -> Duration {
        match self.test_type.strategy() {
            Strategy::Parallel => self.session_duration(),
            Strategy::Sequential | Strategy::Multihop => {
                let count = u32::try_from(asset_count).unwrap_or(u32::MAX);
                self.session_duration().saturating_mul(count)
            }
        }
    }

    pub fn allows(&self, asset_name: &str) -> bool {
        match &self.allow_list {
            Some(list) => list.contains(asset_name),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_strings() {
        for t in TestType::ALL {
            assert_eq!(t.as_str().parse::<TestType>().unwrap(), t);
        }
        assert_eq!("parallel_node".parse::<TestType>().unwrap(), TestType::ParallelNode);
        assert!("PARALLEL".parse::<TestType>().is_err());
    }

    #[test]
    fn test_type_scope_and_strategy() {
        assert_eq!(TestType::SequentialLink.scope(), AssetScope::Link);
        assert_eq!(TestType::Multihop.scope(), AssetScope::Node);
        assert_eq!(TestType::ParallelNode.strategy(), Strategy::Parallel);
        assert_eq!(TestType::Multihop.strategy(), Strategy::Multihop);
    }

    #[test]
    fn test_defaults_udp_json() {
        let def = TestDefinition::new("net", TestType::SequentialLink, TrafficOptions::default(), None);
        assert_eq!(def.options.protocol, Some(Protocol::Udp));
        assert_eq!(def.options.json, Some(true));
        assert_eq!(def.options.bitrate, Some(200_000_000));
        assert_eq!(def.options.time_sec, Some(60));
    }

    #[test]
    fn test_caller_options_override_defaults() {
        let options: TrafficOptions =
            serde_json::from_value(serde_json::json!({"timeSec": 10, "protocol": "TCP", "parallelStreams": 4}))
                .unwrap();
        let def = TestDefinition::new("net", TestType::ParallelLink, options, None);
        assert_eq!(def.options.time_sec, Some(10));
        assert_eq!(def.options.protocol, Some(Protocol::Tcp));
        assert_eq!(def.options.bitrate, Some(100_000_000));
        assert_eq!(def.options.extra.get("parallelStreams"), Some(&serde_json::json!(4)));
    }

    #[test]
    fn test_estimate_duration() {
        let parallel = TestDefinition::new("net", TestType::ParallelLink, TrafficOptions::default(), None);
        assert_eq!(parallel.estimate_duration(10), Duration::from_secs(300));

        let sequential = TestDefinition::new("net", TestType::SequentialNode, TrafficOptions::default(), None);
        assert_eq!(sequential.estimate_duration(3), Duration::from_secs(180));

        let multihop = TestDefinition::new("net", TestType::Multihop, TrafficOptions::default(), None);
        assert_eq!(multihop.estimate_duration(4), Duration::from_secs(120));
    }

    #[test]
    fn test_estimate_duration_saturates() {
        let options = TrafficOptions {
            time_sec: Some(u64::MAX / 2),
            ..Default::default()
        };
        let def = TestDefinition::new("net", TestType::SequentialLink, options, None);
        assert_eq!(def.estimate_duration(3), Duration::MAX);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_time_sec() {
        let with_time = |secs| {
            let options = TrafficOptions {
                time_sec: Some(secs),
                ..Default::default()
            };
            TestDefinition::new("net", TestType::Multihop, options, None)
        };
        assert!(matches!(with_time(0).validate(), Err(InvalidValue::TimeSec(0))));
        assert!(with_time(MAX_TIME_SEC + 1).validate().is_err());
        assert!(with_time(1).validate().is_ok());
        assert!(with_time(MAX_TIME_SEC).validate().is_ok());
    }

    #[test]
    fn test_empty_allow_list_means_all() {
        let def = TestDefinition::new(
            "net",
            TestType::ParallelLink,
            TrafficOptions::default(),
            Some(BTreeSet::new()),
        );
        assert!(def.allow_list.is_none());
        assert!(def.allows("anything"));
    }
}
