//! Capability gate: tool and action list enforcement.

use thiserror::Error;

use crate::catalog::{CapabilityMode, CapabilityRules};

/// A capability denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CapabilityDeny {
    /// The action is denied for the resolved scope.
    #[error("action '{action}' is not permitted{}", scope_suffix(.channel.as_deref()))]
    Action {
        /// The denied action.
        action: String,
        /// The channel whose scope denied it, if any.
        channel: Option<String>,
    },

    /// A requested tool is denied for the resolved scope.
    #[error("tool '{tool}' is not permitted{}", scope_suffix(.channel.as_deref()))]
    Tool {
        /// The denied tool.
        tool: String,
        /// The channel whose scope denied it, if any.
        channel: Option<String>,
    },
}

fn scope_suffix(channel: Option<&str>) -> String {
    channel.map_or_else(String::new, |c| format!(" on channel '{c}'"))
}

fn name_permitted(
    scope_mode: CapabilityMode,
    allow: &std::collections::BTreeSet<String>,
    deny: &std::collections::BTreeSet<String>,
    name: &str,
) -> bool {
    if deny.contains(name) {
        return false;
    }
    if allow.contains(name) {
        return true;
    }
    matches!(scope_mode, CapabilityMode::Allow)
}

/// Checks one action against the resolved scope.
///
/// Deny list wins, allow list admits, otherwise the scope mode decides.
///
/// # Errors
///
/// Returns [`CapabilityDeny::Action`] when the action is denied.
pub fn evaluate_action(
    rules: &CapabilityRules,
    channel: Option<&str>,
    action: &str,
) -> Result<(), CapabilityDeny> {
    let scope = rules.scope_for(channel);
    let action_lc = action.to_lowercase();
    if name_permitted(
        scope.mode,
        &scope.allow_actions,
        &scope.deny_actions,
        &action_lc,
    ) {
        Ok(())
    } else {
        Err(CapabilityDeny::Action {
            action: action_lc,
            channel: channel.map(str::to_lowercase),
        })
    }
}

/// Checks a batch of tool names against the resolved scope.
///
/// The first denied tool fails the batch.
///
/// # Errors
///
/// Returns [`CapabilityDeny::Tool`] naming the first denied tool.
pub fn evaluate_tools(
    rules: &CapabilityRules,
    channel: Option<&str>,
    tools: &[String],
) -> Result<(), CapabilityDeny> {
    let scope = rules.scope_for(channel);
    for tool in tools {
        let tool_lc = tool.to_lowercase();
        if !name_permitted(scope.mode, &scope.allow_tools, &scope.deny_tools, &tool_lc) {
            return Err(CapabilityDeny::Tool {
                tool: tool_lc,
                channel: channel.map(str::to_lowercase),
            });
        }
    }
    Ok(())
}
