//! Async websocket driver for [`PlayerSession`].
//!
//! One driver task owns one session. Inbound frames, timer deadlines and
//! deferred sends race in a single `select!`, so messages for a session are
//! always handled one at a time and a fired deadline is seen before any
//! later frame. An [`InterruptSignal`] joins the same race: a raised signal
//! ends the session through its normal teardown, cleanup frames included.

use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use crate::bootstrap::{derive_connection_url, Bootstrapper, LaunchRequest};
use crate::config::RunConfiguration;
use crate::error::BootstrapFailure;
use crate::metrics::{names, MetricsRegistry};
use crate::protocol::codec::encode;
use crate::report_violation;
use crate::script::TurnScript;
use crate::session::machine::PlayerSession;
use crate::session::report::SessionReport;
use crate::session::state::Termination;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::tls::unverified_client_config;

/// Upper bound on flushing the leave/concede frames and closing the socket.
pub(crate) const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Raises the [`InterruptSignal`]s handed out by [`interrupt_channel`].
#[derive(Debug)]
pub struct Interrupter(watch::Sender<bool>);

impl Interrupter {
    /// Asks every session watching this interrupter to tear down now.
    pub fn raise(&self) {
        self.0.send_replace(true);
    }
}

/// Watched by running sessions; once raised it stays raised.
#[derive(Debug, Clone)]
pub struct InterruptSignal(watch::Receiver<bool>);

impl InterruptSignal {
    /// A signal nothing can raise.
    #[must_use]
    pub fn never() -> Self {
        let (_interrupter, signal) = interrupt_channel();
        signal
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal is raised; pends forever if it never can be.
    pub async fn raised(&mut self) {
        if self.0.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A connected interrupter and signal pair.
#[must_use]
pub fn interrupt_channel() -> (Interrupter, InterruptSignal) {
    let (sender, receiver) = watch::channel(false);
    (Interrupter(sender), InterruptSignal(receiver))
}

/// Shared, read-only inputs of every iteration in a run.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<RunConfiguration>,
    pub script: Arc<TurnScript>,
    pub metrics: Arc<MetricsRegistry>,
    pub observer: Arc<dyn ViolationObserver>,
    pub bootstrapper: Arc<dyn Bootstrapper>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .field("script", &self.script)
            .finish_non_exhaustive()
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Runs one full iteration for virtual user `vu`: launch, connect, play,
/// tear down. Never fails; every outcome ends up in the report.
pub async fn run_iteration(ctx: &SessionContext, vu: u64, iteration: u64) -> SessionReport {
    run_iteration_until(ctx, vu, iteration, InterruptSignal::never()).await
}

/// Like [`run_iteration`], ending the session as
/// [`Termination::Interrupted`] once `interrupt` is raised.
pub async fn run_iteration_until(
    ctx: &SessionContext,
    vu: u64,
    iteration: u64,
    mut interrupt: InterruptSignal,
) -> SessionReport {
    ctx.metrics.increment(names::VU_ITERATIONS);

    let launched = tokio::select! {
        launched = launch(ctx) => launched,
        () = interrupt.raised() => {
            debug!(vu, iteration, "interrupted during launch");
            return SessionReport::unstarted(vu, iteration, Termination::Interrupted);
        },
    };
    let url = match launched {
        Ok(url) => url,
        Err(failure) => {
            warn!(vu, iteration, %failure, "bootstrap failed");
            return SessionReport::bootstrap_failed(vu, iteration, failure.to_string());
        },
    };
    debug!(vu, iteration, %url, "launch granted");

    let mut session = PlayerSession::new(
        vu,
        iteration,
        ctx.config.session,
        Arc::clone(&ctx.script),
        Arc::clone(&ctx.metrics),
        Arc::clone(&ctx.observer),
    );
    play(&mut session, &url, ctx, &mut interrupt).await;

    let report = session.finish(
        Termination::TransportError {
            context: "driver stopped before the session ended".to_owned(),
        },
        now(),
    );
    debug!(vu, iteration, passed = report.passed(), %report, "session finished");
    report
}

/// Calls the bootstrapper on the blocking pool and derives the socket URL.
async fn launch(ctx: &SessionContext) -> Result<String, BootstrapFailure> {
    ctx.metrics.increment(names::VU_GAMELAUNCH);
    let request = LaunchRequest::from_config(&ctx.config.bootstrap);
    let bootstrapper = Arc::clone(&ctx.bootstrapper);

    let started = now();
    let outcome = tokio::task::spawn_blocking(move || bootstrapper.launch(&request))
        .await
        .unwrap_or_else(|err| {
            Err(BootstrapFailure::Transport {
                context: format!("launch task failed: {}", err),
            })
        });
    let elapsed = now().saturating_duration_since(started);

    // anything past the transport layer means the endpoint answered
    let answered = !matches!(outcome, Err(BootstrapFailure::Transport { .. }));
    if answered {
        ctx.metrics
            .record(names::HTTP_GAMELAUNCH_RESPONSE_TIME, elapsed, &[]);
    }
    let status_ok = matches!(
        outcome,
        Ok(_) | Err(BootstrapFailure::UnparseableBody { .. } | BootstrapFailure::MissingUrl)
    );
    ctx.metrics.check(names::CHECK_STATUS_200, status_ok);

    let response = outcome?;
    let url = derive_connection_url(&response.url, &ctx.config.bootstrap)?;
    ctx.metrics.increment(names::VU_GAMELAUNCH_OK);
    Ok(url)
}

/// Connects and pumps the session until it terminates.
async fn play(
    session: &mut PlayerSession,
    url: &str,
    ctx: &SessionContext,
    interrupt: &mut InterruptSignal,
) {
    session.begin_connect(now());
    let deadline = session.next_deadline();
    // `None` keeps the default webpki-rooted verification
    let connector = ctx
        .config
        .bootstrap
        .tls_skip_verify
        .then(|| Connector::Rustls(unverified_client_config()));

    let socket = tokio::select! {
        result = tokio_tungstenite::connect_async_tls_with_config(url, None, false, connector) => match result {
            Ok((socket, _response)) => socket,
            Err(err) => {
                session.on_transport_error(err.to_string(), now());
                return;
            },
        },
        () = sleep_until_deadline(deadline) => {
            if let Some(at) = deadline {
                session.poll(now().max(at));
            }
            return;
        },
        () = interrupt.raised() => {
            session.terminate(Termination::Interrupted, now());
            return;
        },
    };
    session.on_open(now());
    let (mut sink, mut stream) = socket.split();

    loop {
        flush(session, &mut sink, ctx).await;
        if session.is_terminated() {
            break;
        }

        let deadline = session.next_deadline();
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_frame(text.as_bytes(), now()),
                Some(Ok(Message::Binary(bytes))) => session.handle_frame(&bytes, now()),
                Some(Ok(Message::Close(close))) => {
                    trace!(?close, "server closed the connection");
                    session.on_transport_closed(now());
                },
                Some(Ok(_)) => (),
                Some(Err(err)) => session.on_transport_error(err.to_string(), now()),
                None => session.on_transport_closed(now()),
            },
            () = sleep_until_deadline(deadline) => {
                if let Some(at) = deadline {
                    session.poll(now().max(at));
                }
            },
            () = interrupt.raised() => {
                debug!("interrupted; tearing down");
                session.terminate(Termination::Interrupted, now());
            },
        }
        session.poll(now());
    }

    // cleanup frames queued by the termination; failures are swallowed
    let teardown = async {
        flush(session, &mut sink, ctx).await;
        if let Err(err) = sink.close().await {
            trace!(%err, "close after teardown failed");
        }
    };
    if tokio::time::timeout(TEARDOWN_GRACE, teardown).await.is_err() {
        debug!("teardown flush timed out");
    }
}

/// Writes every queued envelope. A failed write ends the session.
async fn flush<S>(session: &mut PlayerSession, sink: &mut S, ctx: &SessionContext)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let pending: Vec<_> = session.drain_outbound().collect();
    for envelope in pending {
        let text = match encode(&envelope) {
            Ok(text) => text,
            Err(err) => {
                report_violation!(
                    ctx.observer,
                    None,
                    ViolationSeverity::Error,
                    ViolationKind::Codec,
                    "could not encode outbound {}: {}",
                    envelope.command,
                    err
                );
                continue;
            },
        };
        if let Err(err) = sink.send(Message::Text(text)).await {
            session.on_transport_error(err.to_string(), now());
            return;
        }
    }
}
