use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use roam_domain::{SessionId, SessionLocation, SessionMetadata};
use roam_store::{
    BestOffloadTargetsOptions, LastVisitedNotifier, OffloadSessionCommands, OffloadSessionOptions,
    SessionDataStream,
};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::node::Node;
use crate::peer::{PeerClient, PeerLastVisitedNotifier};

const COMMIT_ATTEMPTS: u32 = 5;
const COMMIT_BACKOFF: Duration = Duration::from_millis(100);

/// Reader wrapper that records a broken stream and tears the transfer scope
/// down. End-of-stream is a clean zero-byte read in tokio, so every error
/// seen here is a real producer failure.
struct WatchReader {
    inner: SessionDataStream,
    loader_failed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl AsyncRead for WatchReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Err(error)) => {
                this.loader_failed.store(true, Ordering::SeqCst);
                this.cancel.cancel();
                Poll::Ready(Err(error))
            }
            other => other,
        }
    }
}

/// The three-phase offload: prepare locally, stream to the destination
/// through `transfer`, then commit the forwarding pointer.
///
/// One cancellation scope parents the loader task and the transfer; either
/// side failing cancels the other. A failure before commit aborts the
/// offload and the session stays live here; commit failures retry with
/// exponential backoff and, once exhausted, leave the session mid-offload
/// for a reaper to reconcile.
pub async fn run_offload<F, Fut>(
    cmd: &dyn OffloadSessionCommands,
    session_id: &SessionId,
    opt: &OffloadSessionOptions,
    transfer: F,
    notifier: &dyn LastVisitedNotifier,
) -> Result<SessionLocation, NodeError>
where
    F: FnOnce(SessionMetadata, SessionDataStream) -> Fut,
    Fut: Future<Output = Result<SessionLocation, NodeError>>,
{
    let metadata = cmd.get_session_metadata(session_id).await?;
    let (reader, loader) = cmd.offload_session(session_id, opt).await?;

    let cancel = CancellationToken::new();
    let loader_failed = Arc::new(AtomicBool::new(false));
    let reader: SessionDataStream = Box::new(WatchReader {
        inner: reader,
        loader_failed: loader_failed.clone(),
        cancel: cancel.clone(),
    });

    // The loader is the only extra task a migration spawns.
    let loader_task = loader.map(|loader| {
        let cancel = cancel.clone();
        let loader_failed = loader_failed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = loader => {
                    if let Err(error) = result {
                        warn!(error = %error, "session data loader failed");
                        loader_failed.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                }
            }
        })
    });

    let transfer_result = tokio::select! {
        result = transfer(metadata, reader) => result,
        _ = cancel.cancelled() => {
            Err(NodeError::TransferAborted("transfer cancelled by loader failure".into()))
        }
    };

    // The scope dies with the orchestrator, whatever the outcome.
    cancel.cancel();
    if let Some(task) = loader_task {
        let _ = task.await;
    }

    let new_location = match transfer_result {
        Ok(new_location) if !loader_failed.load(Ordering::SeqCst) => new_location,
        Ok(_) => {
            // The destination acknowledged a damaged stream before any
            // commit was issued: its copy is discarded by the stream abort
            // and the session keeps being served here.
            abort_offload(cmd, session_id).await;
            return Err(NodeError::TransferAborted("loader failed during transfer".into()));
        }
        Err(error) => {
            abort_offload(cmd, session_id).await;
            return Err(error);
        }
    };

    let mut attempts = 0;
    loop {
        attempts += 1;
        match cmd
            .confirm_session_offload(session_id, new_location.clone(), opt, notifier)
            .await
        {
            Ok(()) => return Ok(new_location),
            Err(error) if attempts < COMMIT_ATTEMPTS => {
                warn!(
                    session_id = %session_id, attempts, error = %error,
                    "offload commit failed, retrying"
                );
                tokio::time::sleep(COMMIT_BACKOFF * 2u32.pow(attempts - 1)).await;
            }
            Err(source) => return Err(NodeError::CommitFailed { attempts, source }),
        }
    }
}

async fn abort_offload(cmd: &dyn OffloadSessionCommands, session_id: &SessionId) {
    if let Err(error) = cmd.abort_session_offload(session_id).await {
        warn!(session_id = %session_id, error = %error, "offload abort failed");
    }
}

impl Node {
    /// See [`run_offload`].
    pub async fn offload_session<F, Fut>(
        &self,
        session_id: &SessionId,
        opt: &OffloadSessionOptions,
        transfer: F,
        notifier: &dyn LastVisitedNotifier,
    ) -> Result<SessionLocation, NodeError>
    where
        F: FnOnce(SessionMetadata, SessionDataStream) -> Fut,
        Fut: Future<Output = Result<SessionLocation, NodeError>>,
    {
        let cmd: &dyn OffloadSessionCommands = &*self.cmd;
        run_offload(cmd, session_id, opt, transfer, notifier).await
    }

    /// Offload one session to a peer over the given transport.
    pub async fn offload_session_to(
        &self,
        session_id: &SessionId,
        to_host: &str,
        opt: &OffloadSessionOptions,
        peer: &dyn PeerClient,
    ) -> Result<SessionLocation, NodeError> {
        let old_location = self.location(session_id.clone());
        let notifier = PeerLastVisitedNotifier { peer };
        self.offload_session(
            session_id,
            opt,
            |metadata, reader| async move {
                peer.issue_onload(to_host, &old_location, &metadata, reader)
                    .await
                    .map_err(NodeError::from)
            },
            &notifier,
        )
        .await
    }

    /// One scheduling step: pick the costliest local sessions, resolve the
    /// lookup node for them, and walk the ranked `(session, target)` pairs
    /// until one migration succeeds.
    pub async fn begin_offload(
        &self,
        peer: &dyn PeerClient,
    ) -> Result<Option<SessionLocation>, NodeError> {
        let opt = BestOffloadTargetsOptions::default();
        let sessions = self.cmd.best_sessions_to_offload(&opt).await?;
        if sessions.is_empty() {
            return Ok(None);
        }
        let session_ids: Vec<SessionId> = sessions.keys().cloned().collect();

        let lookup = self.cmd.find_lookup_node(&session_ids).await?;
        let targets = if lookup.host == self.info.host {
            self.cmd
                .best_offload_target_nodes(&self.info.host, sessions, &opt)
                .await?
        } else {
            peer.issue_best_offload_targets(&lookup.host, &self.info.host, &sessions)
                .await?
        };

        for (session_id, target_host) in targets {
            if target_host == self.info.host {
                continue;
            }
            match self
                .offload_session_to(&session_id, &target_host, &OffloadSessionOptions::default(), peer)
                .await
            {
                Ok(new_location) => {
                    debug!(session_id = %session_id, target = %target_host, "session migrated");
                    return Ok(Some(new_location));
                }
                Err(error) => {
                    // Fall through to the next ranked pair.
                    warn!(
                        session_id = %session_id, target = %target_host, error = %error,
                        "offload attempt failed"
                    );
                }
            }
        }
        Ok(None)
    }
}
