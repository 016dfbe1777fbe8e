//! Topic namespace shared by producers and consumers.
//!
//! `<root>/<projectCode>/<deviceId>/<channel>` with `channel` either
//! `telemetry` or `command`. Both sides derive topic strings through
//! [`Namespace`], so the mapping cannot drift between publisher and
//! subscriber.

use crate::error::ValidationError;
use std::fmt;

pub const DEFAULT_ROOT: &str = "ecos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Telemetry,
    Command,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Telemetry => "telemetry",
            Channel::Command => "command",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "telemetry" => Some(Channel::Telemetry),
            "command" => Some(Channel::Command),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejects anything that would shift topic levels or act as a wildcard, so an
/// id can never resolve into another project's subtree.
fn check_segment(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if let Some(bad) = value.chars().find(|c| matches!(c, '/' | '+' | '#' | '\0')) {
        return Err(ValidationError::new(
            field,
            format!("'{}' contains reserved topic character '{}'", value, bad),
        ));
    }
    Ok(())
}

/// (project, device, channel) tuple identifying exactly one topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicAddress {
    project_code: String,
    device_id: String,
    channel: Channel,
}

impl TopicAddress {
    pub fn new(
        project_code: impl Into<String>,
        device_id: impl Into<String>,
        channel: Channel,
    ) -> Result<Self, ValidationError> {
        let project_code = project_code.into();
        let device_id = device_id.into();
        check_segment("projectCode", &project_code)?;
        check_segment("deviceId", &device_id)?;
        Ok(Self {
            project_code,
            device_id,
            channel,
        })
    }

    pub fn telemetry(
        project_code: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::new(project_code, device_id, Channel::Telemetry)
    }

    pub fn command(
        project_code: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::new(project_code, device_id, Channel::Command)
    }

    pub fn project_code(&self) -> &str {
        &self.project_code
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

impl fmt::Display for TopicAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project_code, self.device_id, self.channel)
    }
}

/// Subscription scope: one device, every device of a project, or the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    project_code: Option<String>,
    device_id: Option<String>,
    channel: Channel,
}

impl TopicFilter {
    pub fn device(address: &TopicAddress) -> Self {
        Self {
            project_code: Some(address.project_code.clone()),
            device_id: Some(address.device_id.clone()),
            channel: address.channel,
        }
    }

    pub fn project(project_code: impl Into<String>, channel: Channel) -> Result<Self, ValidationError> {
        let project_code = project_code.into();
        check_segment("projectCode", &project_code)?;
        Ok(Self {
            project_code: Some(project_code),
            device_id: None,
            channel,
        })
    }

    pub fn fleet(channel: Channel) -> Self {
        Self {
            project_code: None,
            device_id: None,
            channel,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: String,
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
        }
    }
}

impl Namespace {
    /// `root` may span several levels (`org/ecos`) but must not contain
    /// wildcards or empty levels.
    pub fn new(root: impl Into<String>) -> Result<Self, ValidationError> {
        let root = root.into();
        if root.is_empty() || root.split('/').any(str::is_empty) {
            return Err(ValidationError::new("root", "topic root has an empty level"));
        }
        if root.contains(['+', '#']) {
            return Err(ValidationError::new("root", "topic root must not contain wildcards"));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn topic(&self, address: &TopicAddress) -> String {
        format!(
            "{}/{}/{}/{}",
            self.root, address.project_code, address.device_id, address.channel
        )
    }

    pub fn filter(&self, filter: &TopicFilter) -> String {
        format!(
            "{}/{}/{}/{}",
            self.root,
            filter.project_code.as_deref().unwrap_or("+"),
            filter.device_id.as_deref().unwrap_or("+"),
            filter.channel
        )
    }

    /// Inverse of [`Namespace::topic`].
    pub fn parse(&self, topic: &str) -> Result<TopicAddress, ValidationError> {
        let rest = topic
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                ValidationError::new("topic", format!("'{}' is outside root '{}'", topic, self.root))
            })?;

        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 3 {
            return Err(ValidationError::new(
                "topic",
                format!(
                    "'{}' does not match '{}/{{projectCode}}/{{deviceId}}/{{channel}}'",
                    topic, self.root
                ),
            ));
        }

        let channel = Channel::from_segment(parts[2]).ok_or_else(|| {
            ValidationError::new("topic", format!("unknown channel '{}'", parts[2]))
        })?;
        TopicAddress::new(parts[0], parts[1], channel)
    }
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the
/// remaining levels including none.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
