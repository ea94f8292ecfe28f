use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{Stream, stream};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{Mutex, mpsc, watch},
    task::JoinSet,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    acceptor::ProxyAcceptor,
    config::ProxyProtocolConfig,
    error::{ConfigError, Error},
    security::AllowList,
    stream::ProxyStream,
};

/// Classified connections waiting for an `accept` call
const READY_BACKLOG: usize = 128;

/// Pause after an accept error that is not about a single connection,
/// e.g. running out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

type Accepted = Result<ProxyStream<TcpStream>, Error>;

/// TCP listener that classifies every accepted connection with a
/// [`ProxyAcceptor`] before handing it out.
///
/// A background task accepts raw connections and reads each header in its
/// own task, so a slow or silent peer only delays itself. Construction must
/// happen inside a tokio runtime.
pub struct ProxyProtocolListener {
    listener: Arc<TcpListener>,
    acceptor: ProxyAcceptor,
    closed: watch::Sender<bool>,
    ready: Mutex<mpsc::Receiver<Accepted>>,
}

impl ProxyProtocolListener {
    /// Wraps a bound listener; `allowed` is `"*"` or a comma-separated list of
    /// IPs and CIDR blocks.
    pub fn new(
        listener: TcpListener,
        allowed: &str,
        header_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let allow_list = Arc::new(AllowList::parse(allowed)?);
        Ok(Self::with_acceptor(
            listener,
            ProxyAcceptor::new(allow_list, header_timeout),
        ))
    }

    #[must_use]
    pub fn with_acceptor(listener: TcpListener, acceptor: ProxyAcceptor) -> Self {
        let listener = Arc::new(listener);
        let (closed, closed_rx) = watch::channel(false);
        let (ready_tx, ready) = mpsc::channel(READY_BACKLOG);
        tokio::spawn(accept_loop(
            listener.clone(),
            acceptor.clone(),
            closed_rx,
            ready_tx,
        ));
        Self {
            listener,
            acceptor,
            closed,
            ready: Mutex::new(ready),
        }
    }

    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        config: &ProxyProtocolConfig,
    ) -> anyhow::Result<Self> {
        let acceptor = ProxyAcceptor::from_config(config)?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::with_acceptor(listener, acceptor))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub const fn acceptor(&self) -> &ProxyAcceptor {
        &self.acceptor
    }

    /// Returns the next classified connection, in the order headers complete.
    ///
    /// A connection whose header is invalid or late is closed and its error
    /// returned; the listener itself stays usable. After [`close`] every call,
    /// including one already waiting, returns [`Error::ListenerClosed`].
    ///
    /// [`close`]: Self::close
    pub async fn accept(&self) -> Accepted {
        tokio::select! {
            biased;
            () = wait_closed(self.closed.subscribe()) => Err(Error::ListenerClosed),
            accepted = async { self.ready.lock().await.recv().await } => {
                accepted.unwrap_or(Err(Error::ListenerClosed))
            }
        }
    }

    /// Stops accepting and aborts every header read still in progress.
    /// Pending and future [`accept`](Self::accept) calls return
    /// [`Error::ListenerClosed`].
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            info!("PROXY protocol listener closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Accepted connections as a stream, ending once the listener is closed.
    ///
    /// Per-connection errors are yielded, not fatal.
    pub fn incoming(&self) -> impl Stream<Item = Accepted> + '_ {
        stream::unfold(self, |listener| async move {
            match listener.accept().await {
                Err(Error::ListenerClosed) => None,
                result => Some((result, listener)),
            }
        })
    }
}

/// Accepts raw connections until closed, reading each header in its own task.
///
/// Dropping `sniffing` on exit aborts header reads still in flight.
async fn accept_loop(
    listener: Arc<TcpListener>,
    acceptor: ProxyAcceptor,
    closed: watch::Receiver<bool>,
    ready: mpsc::Sender<Accepted>,
) {
    let closed = wait_closed(closed);
    tokio::pin!(closed);
    let mut sniffing = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            () = &mut closed => break,
            Some(_) = sniffing.join_next(), if !sniffing.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let acceptor = acceptor.clone();
                    let ready = ready.clone();
                    sniffing.spawn(async move {
                        let result = acceptor.accept(stream).await.inspect_err(|e| {
                            warn!(peer = %peer, error = %e, "rejected connection");
                        });
                        // Receiver gone means the listener was dropped
                        let _ = ready.send(result).await;
                    });
                }
                Err(e) => {
                    let transient = is_connection_error(&e);
                    if ready.send(Err(e.into())).await.is_err() {
                        break;
                    }
                    if !transient {
                        error!(
                            backoff_ms = ACCEPT_ERROR_BACKOFF.as_millis() as u64,
                            "accept failed, backing off"
                        );
                        tokio::select! {
                            () = &mut closed => break,
                            () = sleep(ACCEPT_ERROR_BACKOFF) => {}
                        }
                    }
                }
            },
        }
    }

    debug!(aborted = sniffing.len(), "accept loop stopped");
}

/// Errors that concern only the connection being accepted; the listener
/// itself is fine and can accept again immediately.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}
