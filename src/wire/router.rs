//! Request/response correlation over the single outbound socket
//!
//! Every request gets a monotonic sequence number; responses are matched back
//! by `request_seq` only. Callers either fire-and-forget (`post`), await the
//! response (`request`), or wait with a timeout plus a short-circuit predicate
//! (`request_with`) so an exiting debuggee cannot deadlock a synchronous
//! caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::codec;
use super::types::{Request, Response};
use crate::common::{Error, Result};

pub struct Router {
    /// Sequence number for requests
    seq: AtomicI64,
    /// Pending requests waiting for responses
    pending: StdMutex<HashMap<i64, oneshot::Sender<Response>>>,
    /// Buffered writer for the socket's write half
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    /// Cancelled when the session goes away
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(writer: OwnedWriteHalf, shutdown: CancellationToken) -> Self {
        Self {
            seq: AtomicI64::new(1),
            pending: StdMutex::new(HashMap::new()),
            writer: Mutex::new(BufWriter::new(writer)),
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, oneshot::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write(&self, json: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        codec::write_packet(&mut *writer, json).await
    }

    /// Half-close the socket
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Send a request without waiting for a response
    ///
    /// Used for commands whose response carries nothing the client needs
    /// (`continue`, `disconnect`); a late response for an uninstalled sequence
    /// number is dropped with a log line.
    pub async fn post(&self, command: &str, arguments: Option<Value>) -> Result<()> {
        let request = Request::new(self.next_seq(), command, arguments);
        let json = serde_json::to_string(&request)?;
        tracing::debug!(command, "engine <<< {json}");
        self.write(&json).await
    }

    async fn install_and_send(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<oneshot::Receiver<Response>> {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending_lock().insert(seq, tx);

        let request = Request::new(seq, command, arguments);
        let json = serde_json::to_string(&request)?;
        tracing::debug!(command, "engine <<< {json}");

        if let Err(err) = self.write(&json).await {
            self.pending_lock().remove(&seq);
            return Err(err);
        }
        Ok(rx)
    }

    /// Send a request and wait for its response
    pub async fn request(&self, command: &str, arguments: Option<Value>) -> Result<Response> {
        let rx = self.install_and_send(command, arguments).await?;
        match rx.await {
            Ok(response) => check_success(command, response),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Send a request with a bounded wait
    ///
    /// If `short_circuit` is already true the wire is skipped and the call
    /// fails immediately. While waiting, the predicate is polled every
    /// `max(1, timeout/10)` ms. A timed-out or short-circuited entry is left
    /// in the pending map to be reaped when the late response arrives.
    pub async fn request_with(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
        short_circuit: impl Fn() -> bool,
    ) -> Result<Response> {
        if short_circuit() {
            return Err(Error::Aborted {
                command: command.to_string(),
            });
        }

        let mut rx = self.install_and_send(command, arguments).await?;
        let poll = Duration::from_millis((timeout.as_millis() as u64 / 10).max(1));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::select! {
                result = &mut rx => {
                    return match result {
                        Ok(response) => check_success(command, response),
                        Err(_) => Err(Error::ConnectionClosed),
                    };
                }
                _ = tokio::time::sleep(poll) => {
                    if short_circuit() {
                        return Err(Error::Aborted {
                            command: command.to_string(),
                        });
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Timeout {
                            command: command.to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                }
            }
        }
    }

    /// Route an inbound response to its waiter
    ///
    /// Dequeues exactly one pending entry; unmatched sequence numbers (late
    /// responses whose waiter gave up) are dropped with a log line.
    pub fn deliver(&self, response: Response) {
        let tx = self.pending_lock().remove(&response.request_seq);
        match tx {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!(
                request_seq = response.request_seq,
                "response without a pending request"
            ),
        }
    }

    /// Fail every outstanding request (the socket is gone)
    pub fn fail_all(&self) {
        let pending = std::mem::take(&mut *self.pending_lock());
        // Dropping the senders wakes each waiter with a closed-channel error.
        drop(pending);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending_lock().len()
    }
}

fn check_success(command: &str, response: Response) -> Result<Response> {
    if response.success {
        Ok(response)
    } else {
        Err(Error::CommandFailed {
            command: command.to_string(),
            message: response
                .message
                .unwrap_or_else(|| "unknown engine error".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    async fn router_pair() -> (Arc<Router>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = client.into_split();
        (
            Arc::new(Router::new(write, CancellationToken::new())),
            server,
        )
    }

    fn response(request_seq: i64, success: bool) -> Response {
        Response {
            request_seq,
            success,
            command: String::new(),
            message: if success {
                None
            } else {
                Some("boom".to_string())
            },
            body: None,
            refs: None,
            running: false,
        }
    }

    #[tokio::test]
    async fn deliver_completes_exactly_one_waiter() {
        let (router, _server) = router_pair().await;

        let waiter = {
            let router = router.clone();
            tokio::spawn(async move { router.request("scripts", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(router.pending_len(), 1);

        router.deliver(response(1, true));
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(router.pending_len(), 0);

        // A duplicate delivery for the same sequence finds nothing.
        router.deliver(response(1, true));
        assert_eq!(router.pending_len(), 0);
    }

    #[tokio::test]
    async fn engine_failure_reaches_the_caller() {
        let (router, _server) = router_pair().await;

        let waiter = {
            let router = router.clone();
            tokio::spawn(async move { router.request("evaluate", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.deliver(response(1, false));

        match waiter.await.unwrap() {
            Err(Error::CommandFailed { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_leaves_the_entry_for_late_reap() {
        let (router, _server) = router_pair().await;

        let result = router
            .request_with("listbreakpoints", None, Duration::from_millis(50), || false)
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(router.pending_len(), 1);

        // The late response reaps the abandoned entry.
        router.deliver(response(1, true));
        assert_eq!(router.pending_len(), 0);
    }

    #[tokio::test]
    async fn short_circuit_skips_the_wire() {
        let (router, _server) = router_pair().await;

        let result = router
            .request_with("listbreakpoints", None, Duration::from_secs(2), || true)
            .await;
        assert!(matches!(result, Err(Error::Aborted { .. })));
        assert_eq!(router.pending_len(), 0);
    }

    #[tokio::test]
    async fn short_circuit_unblocks_within_one_poll_interval() {
        let (router, _server) = router_pair().await;
        let gone = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let waiter = {
            let router = router.clone();
            let gone = gone.clone();
            tokio::spawn(async move {
                router
                    .request_with("listbreakpoints", None, Duration::from_secs(2), || {
                        gone.load(Ordering::SeqCst)
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let start = std::time::Instant::now();
        gone.store(true, Ordering::SeqCst);
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Aborted { .. })));
        // One 200 ms polling interval, not the full two-second budget.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn fail_all_unblocks_waiters() {
        let (router, _server) = router_pair().await;

        let waiter = {
            let router = router.clone();
            tokio::spawn(async move { router.request("backtrace", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.fail_all();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::ConnectionClosed)
        ));
    }
}
