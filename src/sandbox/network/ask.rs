use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A host the proxy could not decide from the explicit lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostRequest {
    pub host: String,
    pub port: u16,
}

/// Out-of-band decision hook, typically bound to a permission prompt.
///
/// Invoked at most once per undecided host per generation. The proxy bounds
/// the wait with a timeout and treats a timeout as a deny.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AskCallback: Send + Sync {
    /// Return `true` to allow `request.host` for the rest of the generation.
    async fn ask(&self, request: HostRequest) -> bool;
}

/// Shareable handle to an [`AskCallback`].
#[derive(Clone)]
pub struct AskHandle(Arc<dyn AskCallback>);

impl AskHandle {
    pub fn new(callback: impl AskCallback + 'static) -> Self {
        Self(Arc::new(callback))
    }

    pub fn from_arc(callback: Arc<dyn AskCallback>) -> Self {
        Self(callback)
    }

    pub async fn ask(&self, request: HostRequest) -> bool {
        self.0.ask(request).await
    }
}

impl fmt::Debug for AskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AskHandle(..)")
    }
}

/// A suspended request waiting for the permission layer's answer.
#[derive(Debug)]
pub struct PendingDecision {
    pub request: HostRequest,
    responder: oneshot::Sender<bool>,
}

impl PendingDecision {
    pub fn respond(self, allow: bool) {
        // The proxy may have timed out already; nobody is left to tell.
        let _ = self.responder.send(allow);
    }

    pub fn allow(self) {
        self.respond(true);
    }

    pub fn deny(self) {
        self.respond(false);
    }
}

/// [`AskCallback`] that hands each question to a receiver owned by the
/// host application and waits for the reply.
///
/// A closed channel or a dropped [`PendingDecision`] counts as a deny.
#[derive(Debug, Clone)]
pub struct ChannelAskCallback {
    tx: mpsc::Sender<PendingDecision>,
}

impl ChannelAskCallback {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingDecision>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AskCallback for ChannelAskCallback {
    async fn ask(&self, request: HostRequest) -> bool {
        let (responder, reply) = oneshot::channel();
        if self
            .tx
            .send(PendingDecision { request, responder })
            .await
            .is_err()
        {
            return false;
        }
        reply.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host: &str) -> HostRequest {
        HostRequest {
            host: host.to_string(),
            port: 443,
        }
    }

    #[tokio::test]
    async fn channel_callback_round_trip() {
        let (callback, mut rx) = ChannelAskCallback::new(4);
        let handle = AskHandle::new(callback);

        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.host, "crates.io");
            pending.allow();
        });

        assert!(handle.ask(request("crates.io")).await);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_decision_denies() {
        let (callback, mut rx) = ChannelAskCallback::new(1);
        let handle = AskHandle::new(callback);

        tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            drop(pending);
        });

        assert!(!handle.ask(request("example.org")).await);
    }

    #[tokio::test]
    async fn closed_channel_denies() {
        let (callback, rx) = ChannelAskCallback::new(1);
        drop(rx);
        assert!(!AskHandle::new(callback).ask(request("example.org")).await);
    }

    #[tokio::test]
    async fn mock_callback_through_handle() {
        let mut mock = MockAskCallback::new();
        mock.expect_ask()
            .withf(|req| req.host == "pypi.org")
            .times(1)
            .returning(|_| true);

        let handle = AskHandle::new(mock);
        assert!(handle.ask(request("pypi.org")).await);
    }
}
