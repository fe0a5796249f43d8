//! Orchestrator configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::activities::RetryPolicy;

pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WORKFLOW_ID_PREFIX: &str = "sale-item-poc-workflow-";
pub const DEFAULT_TASK_QUEUE: &str = "sale_item_poc_task_queue";
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Whether the post-update activity runs after each successful transition action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PostUpdateHook {
    #[default]
    Disabled,
    Enabled,
}

impl PostUpdateHook {
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl FromStr for PostUpdateHook {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "true" | "on" | "1" => Ok(Self::Enabled),
            "disabled" | "false" | "off" | "0" => Ok(Self::Disabled),
            other => Err(format!("unknown post-update hook setting: {other}")),
        }
    }
}

/// Settings shared by every orchestration a runtime hosts.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Upper bound on a single dispatcher call.
    pub activity_timeout: Duration,
    pub activity_retry: RetryPolicy,
    pub post_update: PostUpdateHook,
    pub workflow_id_prefix: String,
    /// Recorded in logs and history; there is no worker routing.
    pub task_queue: String,
    /// Bounded size of each orchestration's message queue.
    pub mailbox_capacity: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            activity_retry: RetryPolicy::no_retry(),
            post_update: PostUpdateHook::Disabled,
            workflow_id_prefix: DEFAULT_WORKFLOW_ID_PREFIX.to_string(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

impl WorkflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `SALEFLOW_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("SALEFLOW_ACTIVITY_TIMEOUT_MS") {
            if ms == 0 {
                tracing::warn!("SALEFLOW_ACTIVITY_TIMEOUT_MS must be positive; using default");
            } else {
                config.activity_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(attempts) = env_parse::<u32>("SALEFLOW_ACTIVITY_MAX_ATTEMPTS") {
            let delay = env_parse::<u64>("SALEFLOW_ACTIVITY_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_DELAY);
            config.activity_retry = RetryPolicy::fixed(attempts, delay);
        }

        if let Some(hook) = env_parse::<PostUpdateHook>("SALEFLOW_POST_UPDATE_HOOK") {
            config.post_update = hook;
        }

        if let Ok(prefix) = std::env::var("SALEFLOW_WORKFLOW_ID_PREFIX") {
            config.workflow_id_prefix = prefix;
        }

        if let Ok(queue) = std::env::var("SALEFLOW_TASK_QUEUE") {
            config.task_queue = queue;
        }

        if let Some(capacity) = env_parse::<usize>("SALEFLOW_MAILBOX_CAPACITY") {
            if capacity == 0 {
                tracing::warn!("SALEFLOW_MAILBOX_CAPACITY must be positive; using default");
            } else {
                config.mailbox_capacity = capacity;
            }
        }

        config
    }

    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = timeout;
        self
    }

    pub fn with_activity_retry(mut self, retry: RetryPolicy) -> Self {
        self.activity_retry = retry;
        self
    }

    pub fn with_post_update(mut self, hook: PostUpdateHook) -> Self {
        self.post_update = hook;
        self
    }

    pub fn with_workflow_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.workflow_id_prefix = prefix.into();
        self
    }

    pub fn with_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_queue = queue.into();
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_constants() {
        let config = WorkflowConfig::default();
        assert_eq!(config.activity_timeout, Duration::from_secs(10));
        assert_eq!(config.workflow_id_prefix, "sale-item-poc-workflow-");
        assert_eq!(config.task_queue, "sale_item_poc_task_queue");
        assert_eq!(config.post_update, PostUpdateHook::Disabled);
        assert_eq!(config.activity_retry, RetryPolicy::no_retry());
    }

    #[test]
    fn post_update_hook_parses_common_spellings() {
        assert_eq!("Enabled".parse::<PostUpdateHook>().unwrap(), PostUpdateHook::Enabled);
        assert_eq!("off".parse::<PostUpdateHook>().unwrap(), PostUpdateHook::Disabled);
        assert!("sometimes".parse::<PostUpdateHook>().is_err());
    }

    #[test]
    fn builder_clamps_mailbox_capacity() {
        let config = WorkflowConfig::new().with_mailbox_capacity(0);
        assert_eq!(config.mailbox_capacity, 1);
    }
}
