use std::future::Future;
use std::sync::Arc;

use roam_domain::{SessionLocation, SessionId, SessionToken};
use roam_store::{
    AcquireSessionOptions, Commands, CommandError, CreateAndAcquireSessionOptions,
};
use tracing::warn;

use crate::node::Node;

/// Result of driving a request through the acquisition path. The outcomes
/// are mutually exclusive: either the work ran under a held acquisition, or
/// the session has moved and the caller must redirect.
#[derive(Debug)]
pub enum AcquireOutcome<T> {
    Acquired(T),
    Forwarded(SessionLocation),
}

/// Guarantees exactly one release per successful acquire. The normal path
/// releases explicitly at scope exit; if the work panics or the future is
/// dropped mid-flight, `Drop` hands the release to the runtime.
struct ReleaseGuard {
    cmd: Arc<dyn Commands>,
    session_id: SessionId,
    opt: AcquireSessionOptions,
    armed: bool,
}

impl ReleaseGuard {
    fn new(cmd: Arc<dyn Commands>, session_id: SessionId, opt: AcquireSessionOptions) -> Self {
        ReleaseGuard { cmd, session_id, opt, armed: true }
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(error) = self.cmd.release_session(&self.session_id, &self.opt).await {
            warn!(session_id = %self.session_id, error = %error, "session release failed");
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let cmd = self.cmd.clone();
        let session_id = self.session_id.clone();
        let opt = self.opt.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = cmd.release_session(&session_id, &opt).await {
                    warn!(session_id = %session_id, error = %error, "deferred session release failed");
                }
            });
        } else {
            warn!(session_id = %session_id, "session release leaked: no runtime");
        }
    }
}

impl Node {
    /// Acquire the token's session and run `work` under the acquisition.
    ///
    /// Outcomes:
    /// 1. `Acquired` — the work ran; its result is carried.
    /// 2. `Forwarded` — the session has been offloaded from this node; the
    ///    work did not run and the caller should redirect to the returned
    ///    location.
    /// 3. `Err` — acquisition failed.
    pub async fn acquire_session<T, F, Fut>(
        &self,
        token: &SessionToken,
        opt: &AcquireSessionOptions,
        work: F,
    ) -> Result<AcquireOutcome<T>, CommandError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(forwarded_to) = self.cmd.acquire_session(token.session_id(), opt).await? {
            return Ok(AcquireOutcome::Forwarded(forwarded_to));
        }

        let guard = ReleaseGuard::new(self.cmd.clone(), token.session_id().clone(), opt.clone());
        let result = work().await;
        guard.release().await;
        Ok(AcquireOutcome::Acquired(result))
    }

    /// Create a fresh session, acquire it, and run `work` with its token.
    pub async fn create_and_acquire_session<T, F, Fut>(
        &self,
        opt: &CreateAndAcquireSessionOptions,
        work: F,
    ) -> Result<(SessionToken, T), CommandError>
    where
        F: FnOnce(SessionToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let session_id = self.cmd.create_and_acquire_session(opt).await?;
        let token = SessionToken::new(self.location(session_id.clone()));

        let guard = ReleaseGuard::new(self.cmd.clone(), session_id, opt.acquire.clone());
        let result = work(token.clone()).await;
        guard.release().await;
        Ok((token, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_infra::Infrastructure;
    use roam_store::{
        InMemoryStore, CreateSessionOptions, OffloadSessionOptions, OffloadSessionCommands,
    };

    fn infra() -> Arc<Infrastructure> {
        let json = r#"{
            "areaIdentifiers": ["site"],
            "areas": [{"areaName": "edge-a", "host": "edge-a.example"}]
        }"#;
        Arc::new(Infrastructure::from_json(json.as_bytes()).unwrap())
    }

    fn node() -> (Node, InMemoryStore) {
        let infra = infra();
        let store = InMemoryStore::new("edge-a.example", infra.clone());
        let info = infra.node_by_host("edge-a.example").unwrap().clone();
        (Node::new(info, infra, Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn acquired_runs_work_and_releases() {
        let (node, store) = node();
        let token = node.create_session(&CreateSessionOptions::default()).await.unwrap();

        let outcome = node
            .acquire_session(&token, &AcquireSessionOptions::default(), || async { 41 + 1 })
            .await
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Acquired(42)));

        // The acquisition is gone: the session can offload again.
        assert!(store
            .offload_session(token.session_id(), &OffloadSessionOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn forwarded_skips_work() {
        let (node, store) = node();
        let token = node.create_session(&CreateSessionOptions::default()).await.unwrap();
        store
            .offload_session(token.session_id(), &OffloadSessionOptions::default())
            .await
            .unwrap();
        let forwarded_to = SessionLocation::new("edge-b.example", SessionId::new("s2"));
        store
            .confirm_session_offload(
                token.session_id(),
                forwarded_to.clone(),
                &OffloadSessionOptions::default(),
                &NoopNotifier,
            )
            .await
            .unwrap();

        let outcome = node
            .acquire_session(&token, &AcquireSessionOptions::default(), || async {
                panic!("work must not run for a forwarded session")
            })
            .await
            .unwrap();
        match outcome {
            AcquireOutcome::Forwarded(location) => assert_eq!(location, forwarded_to),
            AcquireOutcome::Acquired(()) => panic!("expected a forward"),
        }
    }

    #[tokio::test]
    async fn create_and_acquire_hands_token_to_work() {
        let (node, _store) = node();
        let (token, seen) = node
            .create_and_acquire_session(&CreateAndAcquireSessionOptions::default(), |token| async move {
                token
            })
            .await
            .unwrap();
        assert_eq!(token, seen);
        assert_eq!(token.host(), "edge-a.example");
    }

    #[tokio::test]
    async fn cancelled_work_still_releases() {
        let (node, store) = node();
        let token = node.create_session(&CreateSessionOptions::default()).await.unwrap();

        let task = {
            let node = node.clone();
            let token = token.clone();
            tokio::spawn(async move {
                node.acquire_session(&token, &AcquireSessionOptions::default(), || async {
                    std::future::pending::<()>().await
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;

        // The drop guard hands the release to the runtime; give it a tick.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(store
            .offload_session(token.session_id(), &OffloadSessionOptions::default())
            .await
            .is_ok());
    }

    struct NoopNotifier;

    #[async_trait::async_trait]
    impl roam_store::LastVisitedNotifier for NoopNotifier {
        async fn notify(
            &self,
            _last_visited: SessionLocation,
            _new_location: SessionLocation,
        ) -> Result<bool, CommandError> {
            Ok(false)
        }
    }
}
