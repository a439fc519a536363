//! Swap in a new ruleset while the worker keeps running.
use std::sync::Arc;

use notify_common::rules::FileRulesetProvider;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Forward every SIGHUP as a reload request until `cancel` fires.
pub async fn forward_hangups(requests: mpsc::Sender<()>, cancel: CancellationToken) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(error) => {
            warn!("ruleset reload on SIGHUP disabled: {}", error);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                // A reload already pending covers this one too.
                _ = requests.try_send(());
            }
        }
    }
}

/// Re-read the ruleset file once per request.
///
/// A file that fails to load is logged and the ruleset in effect stays in place. Notifications
/// validated after a successful reload see the new rules; those already admitted are not
/// validated again.
pub async fn reload_rulesets(
    rulesets: Arc<FileRulesetProvider>,
    mut requests: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => {
                if request.is_none() {
                    break;
                }
                match rulesets.reload() {
                    Ok(ruleset) => {
                        metrics::counter!("notify_ruleset_reloads_total", "result" => "ok")
                            .increment(1);
                        info!(
                            "ruleset {} version {} is now active",
                            ruleset.ruleset_id, ruleset.version
                        );
                    }
                    Err(error) => {
                        metrics::counter!("notify_ruleset_reloads_total", "result" => "error")
                            .increment(1);
                        warn!("ruleset reload failed, keeping the current rules: {}", error);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::rules::RulesetProvider;
    use std::time::Duration;

    fn ruleset_json(version: &str) -> String {
        format!(
            r#"{{"rulesetId": "RS", "version": "{version}", "rules": [
                {{"ruleId": "R1", "type": "required", "field": "name"}}
            ]}}"#
        )
    }

    async fn wait_for_version(rulesets: &FileRulesetProvider, version: &str) {
        for _ in 0..200 {
            if rulesets.current().version == version {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rulesets.current().version, version);
    }

    #[tokio::test]
    async fn test_reload_request_installs_new_ruleset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ruleset.json");
        std::fs::write(&path, ruleset_json("1")).unwrap();
        let rulesets = Arc::new(FileRulesetProvider::load(&path).unwrap());
        let (sender, receiver) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reload_rulesets(rulesets.clone(), receiver, cancel.clone()));

        std::fs::write(&path, ruleset_json("2")).unwrap();
        sender.send(()).await.unwrap();
        wait_for_version(&rulesets, "2").await;

        std::fs::write(&path, "not json").unwrap();
        sender.send(()).await.unwrap();
        std::fs::write(&path, ruleset_json("3")).unwrap();
        sender.send(()).await.unwrap();
        wait_for_version(&rulesets, "3").await;

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_current_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ruleset.json");
        std::fs::write(&path, ruleset_json("1")).unwrap();
        let rulesets = Arc::new(FileRulesetProvider::load(&path).unwrap());
        let (sender, receiver) = mpsc::channel(1);
        let task = tokio::spawn(reload_rulesets(
            rulesets.clone(),
            receiver,
            CancellationToken::new(),
        ));

        std::fs::remove_file(&path).unwrap();
        sender.send(()).await.unwrap();
        drop(sender);
        task.await.unwrap();

        assert_eq!(rulesets.current().version, "1");
        assert_eq!(rulesets.current().rules.len(), 1);
    }
}
