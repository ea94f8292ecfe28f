use bytes::{Buf, Bytes};
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::header::{Header, OriginalEndpoint};

/// Raw accepted connection: a duplex byte stream with socket addresses.
pub trait Transport: AsyncRead + AsyncWrite + Unpin {
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Self::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Self::local_addr(self)
    }
}

/// Connection with its PROXY header already classified and stripped.
///
/// Bytes read past the header during classification are replayed by the
/// first reads; after that, reads go straight to the inner stream.
#[derive(Debug)]
pub struct ProxyStream<S> {
    inner: S,
    header: Header,
    peer_addr: SocketAddr,
    leftover: Bytes,
}

impl<S: Transport> ProxyStream<S> {
    pub(crate) fn new(inner: S, header: Header, peer_addr: SocketAddr, leftover: Bytes) -> Self {
        Self {
            inner,
            header,
            peer_addr,
            leftover,
        }
    }

    /// Original client address when a trusted header carried one, else the
    /// transport peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.header
            .endpoint()
            .map_or(self.peer_addr, OriginalEndpoint::source)
    }

    /// Address the original client connected to, when a header carried one.
    #[must_use]
    pub fn destination_addr(&self) -> Option<SocketAddr> {
        self.header.endpoint().map(OriginalEndpoint::destination)
    }

    /// Address of the socket peer, normally the load balancer.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    #[must_use]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    pub const fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Reading through this skips any bytes not yet replayed.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Returns the inner stream and the bytes still waiting to be replayed.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.leftover)
    }
}

impl<S: Transport> AsyncRead for ProxyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.leftover.has_remaining() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover[..n]);
            this.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: Transport> AsyncWrite for ProxyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
