// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! The request listener: one request per loopback TCP connection. A
//! request must decrypt under the published key (unless cleartext mode is
//! configured), parse, name an allowed user, and — when the kernel socket
//! table can answer — arrive from a connection that user owns. Rejected
//! connections are closed with no body.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::crypto::RequestKey;
use crate::request::OptimizationRequest;
use crate::session::{self, Context};
use crate::users;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BODY: usize = 64 * 1024;

/// Budget for in-flight sessions to roll back during shutdown.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

/// The optimizer's TCP front end.
pub struct Server {
    ctx: Rc<Context>,
    key: Option<RequestKey>,
    cancel: CancellationToken,
    sessions: RefCell<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(ctx: Rc<Context>, key: Option<RequestKey>, cancel: CancellationToken) -> Rc<Self> {
        Rc::new(Self {
            ctx,
            key,
            cancel,
            sessions: RefCell::new(Vec::new()),
        })
    }

    /// Accepts requests until cancelled, then waits for live sessions to
    /// finish their rollback within a bounded budget.
    pub async fn run(self: &Rc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("shutdown requested");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Rc::clone(self);
                            tokio::task::spawn_local(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(why) => {
                            tracing::error!("failed to accept a connection: {}", why);
                        }
                    }
                }
            }
        }

        self.drain_sessions().await;
    }

    async fn drain_sessions(&self) {
        let sessions = std::mem::take(&mut *self.sessions.borrow_mut());

        if sessions.is_empty() {
            return;
        }

        tracing::info!("waiting for {} session(s) to roll back", sessions.len());
        let deadline = tokio::time::Instant::now() + SHUTDOWN_BUDGET;

        for session in sessions {
            if tokio::time::timeout_at(deadline, session).await.is_err() {
                tracing::warn!("session rollback exceeded the shutdown budget");
                return;
            }
        }
    }

    async fn handle_connection(self: &Rc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let mut raw = Vec::with_capacity(1024);

        let read = tokio::time::timeout(
            READ_TIMEOUT,
            (&mut stream).take(MAX_BODY as u64).read_to_end(&mut raw),
        )
        .await;

        match read {
            Ok(Ok(_)) => {}
            Ok(Err(why)) => {
                tracing::warn!("failed to read a request from {}: {}", peer, why);
                return;
            }
            // A client that holds the connection open still gets its body
            // processed once the read window closes.
            Err(_) if !raw.is_empty() => {
                tracing::debug!("request from {} was not closed: processing what arrived", peer);
            }
            Err(_) => {
                tracing::warn!("request from {} timed out", peer);
                return;
            }
        }

        let text = match std::str::from_utf8(&raw) {
            Ok(text) => text.trim(),
            Err(_) => {
                tracing::warn!("request from {} is not valid UTF-8", peer);
                return;
            }
        };

        if text.is_empty() {
            tracing::warn!("empty request from {}", peer);
            return;
        }

        let body = match &self.key {
            Some(key) => match key.open(text) {
                Ok(body) => body,
                Err(why) => {
                    tracing::warn!("rejected request from {}: {}", peer, why);
                    return;
                }
            },
            None => text.to_owned(),
        };

        let mut request = match OptimizationRequest::parse(&body) {
            Ok(request) => request,
            Err(why) => {
                tracing::warn!("invalid request from {}: {}", peer, why);
                return;
            }
        };

        if !users::user_allowed(&self.ctx.settings.allowed_users, &request.user_name) {
            tracing::info!(
                "request not allowed for user '{}' (pid={})",
                request.user_name,
                request.pid
            );
            return;
        }

        let Some(uid) = users::resolve_uid(&request.user_name) else {
            tracing::warn!("unknown requesting user '{}' (pid={})", request.user_name, request.pid);
            return;
        };

        request.user_id = Some(uid);

        // Best-effort check that the connection really belongs to the
        // claimed user. Root clients may request on anyone's behalf.
        if let Some(peer_uid) = users::connection_uid(peer) {
            if peer_uid != uid && peer_uid != 0 {
                tracing::warn!(
                    "user '{}' claimed by a connection owned by uid {} (pid={})",
                    request.user_name,
                    peer_uid,
                    request.pid
                );
                return;
            }
        }

        if !self.ctx.queue_add(request.pid) {
            tracing::info!("repeated request for process {}: ignoring it", request.pid);
            let _res = stream.write_all(b"OK\n").await;
            return;
        }

        tracing::info!("new request: {}", request);
        let _res = stream.write_all(b"OK\n").await;
        drop(stream);

        let ctx = Rc::clone(&self.ctx);
        let cancel = self.cancel.child_token();
        let session = tokio::task::spawn_local(session::handle(ctx, request, cancel));

        let mut sessions = self.sessions.borrow_mut();
        sessions.retain(|handle| !handle.is_finished());
        sessions.push(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guapow_config::settings::OptConfig;

    fn test_settings() -> OptConfig {
        OptConfig {
            check_finished_interval: 0.5,
            children_timeout: 0.0,
            launcher_mapping_timeout: 0.5,
            ..OptConfig::default()
        }
    }

    async fn send(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = Vec::new();
        let _res = stream.read_to_end(&mut response).await;
        response
    }

    async fn start_server(key: Option<RequestKey>) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let ctx = Context::new(test_settings());
        let server = Server::new(ctx, key, cancel.clone());

        tokio::task::spawn_local(async move { server.run(listener).await });

        (addr, cancel)
    }

    fn own_user() -> String {
        ::users::get_current_username()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".into())
    }

    fn sleeper() -> std::process::Child {
        std::process::Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[tokio::test]
    async fn cleartext_request_accepted_in_development_mode() {
        let local = tokio::task::LocalSet::new();

        local
            .run_until(async {
                let (addr, cancel) = start_server(None).await;
                let mut child = sleeper();

                let body = format!(
                    "request.pid={} request.user={} proc.nice=15",
                    child.id(),
                    own_user()
                );

                let response = send(addr, body.as_bytes()).await;
                assert_eq!(response, b"OK\n");

                child.kill().unwrap();
                child.wait().unwrap();
                cancel.cancel();
            })
            .await;
    }

    #[tokio::test]
    async fn undecryptable_request_rejected_with_no_body() {
        let local = tokio::task::LocalSet::new();

        local
            .run_until(async {
                let (addr, cancel) = start_server(Some(RequestKey::generate())).await;

                let response = send(addr, b"request.pid=1 request.user=root proc.nice=1").await;
                assert!(response.is_empty());

                cancel.cancel();
            })
            .await;
    }

    #[tokio::test]
    async fn encrypted_round_trip() {
        let local = tokio::task::LocalSet::new();

        local
            .run_until(async {
                let mut child = sleeper();
                let key = RequestKey::generate();
                let envelope = key.seal(&format!(
                    "request.pid={} request.user={} proc.nice=15",
                    child.id(),
                    own_user()
                ));

                let (addr, cancel) = start_server(Some(key)).await;

                let response = send(addr, envelope.as_bytes()).await;
                assert_eq!(response, b"OK\n");

                child.kill().unwrap();
                child.wait().unwrap();
                cancel.cancel();
            })
            .await;
    }

    #[tokio::test]
    async fn malformed_body_rejected() {
        let local = tokio::task::LocalSet::new();

        local
            .run_until(async {
                let (addr, cancel) = start_server(None).await;

                let response = send(addr, b"request.user=missing-pid proc.nice=1").await;
                assert!(response.is_empty());

                cancel.cancel();
            })
            .await;
    }

    #[tokio::test]
    async fn disallowed_user_rejected() {
        let local = tokio::task::LocalSet::new();

        local
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();

                let cancel = CancellationToken::new();
                let settings = OptConfig {
                    allowed_users: ["somebody-else".to_string()].into(),
                    ..test_settings()
                };

                let server = Server::new(Context::new(settings), None, cancel.clone());
                tokio::task::spawn_local({
                    let server = Rc::clone(&server);
                    async move { server.run(listener).await }
                });

                let body = format!("request.pid=1 request.user={} proc.nice=1", own_user());
                let response = send(addr, body.as_bytes()).await;
                assert!(response.is_empty());

                cancel.cancel();
            })
            .await;
    }
}
