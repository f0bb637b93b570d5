// SPDX-License-Identifier: Apache-2.0

//! The narrow notification sink described in Design Notes §9 and
//! SPEC_FULL §2: the core depends only on this trait, never on a concrete
//! transport. Concrete senders (email, Gotify, Uptime Kuma — see
//! `original_source/lxc_autoscale/notification.py`) are explicitly out of
//! scope; only the interface and two in-core implementations live here.

use log::warn;

/// Priority follows the original source's convention: 1 (highest) through
/// 10 (lowest), default 5.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str, priority: u8);
}

/// Used when no notification sink is configured.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _title: &str, _message: &str, _priority: u8) {}
}

/// Routes notifications through the daemon's own log, useful for
/// deployments that scrape the log file rather than run a separate
/// notification channel.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str, priority: u8) {
        warn!("notification (priority {priority}): {title} — {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_notifier_does_not_panic() {
        NoopNotifier.notify("title", "message", 5);
    }

    #[test]
    fn test_log_notifier_does_not_panic() {
        LogNotifier.notify("title", "message", 1);
    }
}
