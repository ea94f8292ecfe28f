use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::{
    config::ProxyProtocolConfig,
    error::{ConfigError, Error},
    header::{Header, read_header},
    security::AllowList,
    stream::{ProxyStream, Transport},
};

/// Turns raw accepted connections into [`ProxyStream`]s.
///
/// Cheap to clone; the allow-list is shared.
#[derive(Debug, Clone)]
pub struct ProxyAcceptor {
    allow_list: Arc<AllowList>,
    header_timeout: Duration,
    require_header: bool,
}

impl ProxyAcceptor {
    #[must_use]
    pub fn new(allow_list: Arc<AllowList>, header_timeout: Duration) -> Self {
        Self {
            allow_list,
            header_timeout,
            require_header: false,
        }
    }

    pub fn from_config(config: &ProxyProtocolConfig) -> Result<Self, ConfigError> {
        let allow_list = AllowList::parse(&config.allowed_proxy_ips)?;
        Ok(Self::new(Arc::new(allow_list), config.timeout_duration())
            .require_header(config.require_header))
    }

    /// Reject trusted peers that send no header instead of passing them through.
    #[must_use]
    pub fn require_header(mut self, require: bool) -> Self {
        self.require_header = require;
        self
    }

    #[must_use]
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    #[must_use]
    pub const fn header_timeout(&self) -> Duration {
        self.header_timeout
    }

    /// Classifies the front of `stream` and wraps it.
    ///
    /// Peers outside the allow-list are wrapped untouched. For trusted peers
    /// the whole header must arrive before the timeout. On error `stream` is
    /// dropped, which closes it.
    pub async fn accept<S: Transport>(&self, mut stream: S) -> Result<ProxyStream<S>, Error> {
        let peer = stream.peer_addr()?;

        if !self.allow_list.is_allowed(peer.ip()) {
            debug!(peer = %peer, "peer not in allow-list, skipping PROXY header");
            return Ok(ProxyStream::new(stream, Header::Absent, peer, Bytes::new()));
        }

        let deadline = Instant::now() + self.header_timeout;
        let (header, leftover) =
            match timeout_at(deadline, read_header(&mut stream, self.require_header)).await {
                Ok(Ok(parsed)) => parsed,
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "invalid PROXY header");
                    return Err(e);
                }
                Err(_) => {
                    warn!(
                        peer = %peer,
                        timeout_ms = self.header_timeout.as_millis() as u64,
                        "timed out waiting for PROXY header"
                    );
                    return Err(Error::HeaderReadTimeout);
                }
            };

        let stream = ProxyStream::new(stream, header, peer, leftover.freeze());
        debug!(
            peer = %peer,
            remote = %stream.remote_addr(),
            version = ?header.version(),
            "connection accepted"
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{ProtocolVersion, encode_v2};
    use crate::test_util::MockConn;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio_test::io::Builder;

    const PEER: &str = "192.168.1.51:8080";

    fn acceptor(spec: &str) -> ProxyAcceptor {
        ProxyAcceptor::new(
            Arc::new(AllowList::parse(spec).unwrap()),
            Duration::from_secs(5),
        )
    }

    fn v2_tcp4() -> Bytes {
        let endpoint = crate::header::OriginalEndpoint::new(
            "192.168.1.100:5678".parse().unwrap(),
            "192.168.1.5:4000".parse().unwrap(),
        )
        .unwrap();
        encode_v2(Some(&endpoint))
    }

    async fn read_all<S: Transport>(stream: &mut ProxyStream<S>) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    /// Accepts `input` delivered as the given chunks and returns the remote
    /// address and the full payload.
    async fn accept_chunks(chunks: &[&[u8]]) -> Result<(SocketAddr, Vec<u8>), Error> {
        let mut builder = Builder::new();
        for chunk in chunks {
            builder.read(chunk);
        }
        let mut stream = acceptor("*")
            .accept(MockConn::new(builder.build(), PEER))
            .await?;
        let payload = read_all(&mut stream).await;
        Ok((stream.remote_addr(), payload))
    }

    mod classification {
        use super::*;

        #[tokio::test]
        async fn v1_header_yields_original_client() {
            let (remote, payload) = accept_chunks(&[
                b"PROXY TCP4 192.168.1.100 192.168.1.50 5678 3306\r\nOther Data",
            ])
            .await
            .unwrap();
            assert_eq!(remote.to_string(), "192.168.1.100:5678");
            assert_eq!(payload, b"Other Data");
        }

        #[tokio::test]
        async fn v2_header_yields_original_client() {
            let mut input = v2_tcp4().to_vec();
            input.extend_from_slice(b"Other Data");
            let (remote, payload) = accept_chunks(&[&input]).await.unwrap();
            assert_eq!(remote.to_string(), "192.168.1.100:5678");
            assert_eq!(payload, b"Other Data");
        }

        #[tokio::test]
        async fn v1_outcomes_match_expected_remote() {
            let cases: &[(&[u8], Option<&str>)] = &[
                (
                    b"PROXY TCP4 192.168.1.100 192.168.1.50 5678 3306\r\nOther Data",
                    Some("192.168.1.100:5678"),
                ),
                (
                    b"PROXY UNKNOWN 192.168.1.100 192.168.1.50 5678 3306\r\n",
                    Some(PEER),
                ),
                (b"PROXY TCP 192.168.1.100 192.168.1.50 5678 3306 3307\r\n", None),
                (
                    b"PROXY TCP4 192.168.1.100 192.168.1.50 5678 3306 jkasdjfkljaksldfjklajsdkfjsklafjldsafa",
                    None,
                ),
                (
                    b"PROXY TCP4 192.168.1.100 192.168.1.50 5678 3306785478934785738275489275843728954782598345",
                    None,
                ),
                (
                    b"PROXY TCP6 2001:0db8:85a3:0000:0000:8a2e:0370:7334 2001:0db8:85a3:0000:0000:8a2e:0390:7334 5678 3306\r\n",
                    Some("[2001:db8:85a3::8a2e:370:7334]:5678"),
                ),
                (b"PROXY", None),
                (b"PROXY MCP3 192.168.1.100 192.168.1.50 5678 3306\r\nOther Data", None),
                (b"PROXY UNKNOWN\r\n", Some(PEER)),
            ];

            for &(input, expected) in cases {
                let result = accept_chunks(&[input]).await;
                match (result, expected) {
                    (Ok((remote, _)), Some(expected)) => {
                        assert_eq!(remote.to_string(), expected, "input {input:?}");
                    }
                    (Err(_), None) => {}
                    (result, expected) => {
                        panic!("input {input:?}: expected {expected:?}, got {result:?}")
                    }
                }
            }
        }

        #[tokio::test]
        async fn v2_local_command_uses_peer_address() {
            let mut input = v2_tcp4().to_vec();
            input[12] = 0x20;
            let (remote, payload) = accept_chunks(&[&input]).await.unwrap();
            assert_eq!(remote.to_string(), PEER);
            assert!(payload.is_empty());
        }

        #[tokio::test]
        async fn v2_tlvs_are_consumed_not_delivered() {
            let mut input = v2_tcp4().to_vec();
            input[15] = 12 + 4;
            input.extend_from_slice(&[0x04, 0x00, 0x01, 0xff]);
            input.extend_from_slice(b"payload");
            let (remote, payload) = accept_chunks(&[&input]).await.unwrap();
            assert_eq!(remote.to_string(), "192.168.1.100:5678");
            assert_eq!(payload, b"payload");
        }

        #[tokio::test]
        async fn headerless_connection_is_passed_through() {
            let (remote, payload) = accept_chunks(&[b"GET / HTTP/1.1\r\n\r\n"]).await.unwrap();
            assert_eq!(remote.to_string(), PEER);
            assert_eq!(payload, b"GET / HTTP/1.1\r\n\r\n");
        }

        #[tokio::test]
        async fn headerless_connection_rejected_when_required() {
            let stream = MockConn::new(Builder::new().read(b"this is a invalid header").build(), PEER);
            let result = acceptor("*").require_header(true).accept(stream).await;
            assert!(matches!(result, Err(Error::UnsupportedVersion)));
        }

        #[tokio::test]
        async fn oversized_v2_length_is_rejected() {
            let mut input = v2_tcp4()[..16].to_vec();
            input[14..16].copy_from_slice(&u16::MAX.to_be_bytes());
            let result = accept_chunks(&[&input]).await;
            assert!(matches!(result, Err(Error::HeaderTooLarge(_))));
        }
    }

    mod payload_integrity {
        use super::*;

        #[tokio::test]
        async fn header_split_byte_by_byte() {
            let input = b"PROXY TCP4 192.168.1.100 192.168.1.50 5678 3306\r\nX";
            let chunks: Vec<&[u8]> = input.chunks(1).collect();
            let (remote, payload) = accept_chunks(&chunks).await.unwrap();
            assert_eq!(remote.to_string(), "192.168.1.100:5678");
            assert_eq!(payload, b"X");
        }

        #[tokio::test]
        async fn v2_header_split_across_reads() {
            let mut input = v2_tcp4().to_vec();
            input.extend_from_slice(b"Other Data");
            let chunks: Vec<&[u8]> = input.chunks(5).collect();
            let (remote, payload) = accept_chunks(&chunks).await.unwrap();
            assert_eq!(remote.to_string(), "192.168.1.100:5678");
            assert_eq!(payload, b"Other Data");
        }

        #[tokio::test]
        async fn long_payload_arrives_intact() {
            let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
            let mut first = b"PROXY UNKNOWN\r\n".to_vec();
            first.extend_from_slice(&payload[..3000]);

            let (_, received) = accept_chunks(&[&first, &payload[3000..7000], &payload[7000..]])
                .await
                .unwrap();
            assert_eq!(received, payload);
        }

        #[tokio::test]
        async fn empty_payload() {
            let (_, payload) = accept_chunks(&[b"PROXY UNKNOWN\r\n"]).await.unwrap();
            assert!(payload.is_empty());
        }

        #[tokio::test]
        async fn small_reads_drain_leftover_in_order() {
            let conn = MockConn::new(
                Builder::new()
                    .read(b"PROXY TCP4 192.168.1.100 192.168.1.50 5678 3306\r\nOther Data")
                    .build(),
                PEER,
            );
            let mut stream = acceptor("*").accept(conn).await.unwrap();

            let mut buf = [0u8; 5];
            assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
            assert_eq!(&buf, b"Other");
            assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
            assert_eq!(&buf, b" Data");
            assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        }
    }

    mod trust {
        use super::*;

        #[tokio::test]
        async fn untrusted_peer_header_is_payload() {
            let input = b"PROXY TCP4 192.168.1.100 192.168.1.50 5678 3306\r\nOther Data";
            let conn = MockConn::new(Builder::new().read(input).build(), "192.168.3.100:8080");
            let mut stream = acceptor("192.168.1.0/24").accept(conn).await.unwrap();

            assert_eq!(stream.header(), &Header::Absent);
            assert_eq!(stream.remote_addr().to_string(), "192.168.3.100:8080");
            assert_eq!(read_all(&mut stream).await, input);
        }

        #[tokio::test]
        async fn trusted_peer_in_cidr_block() {
            let conn = MockConn::new(
                Builder::new()
                    .read(b"PROXY TCP4 192.168.1.100 192.168.1.50 5678 3306\r\n")
                    .build(),
                "192.168.2.7:8080",
            );
            let stream = acceptor("192.168.1.0/24,192.168.2.0/24")
                .accept(conn)
                .await
                .unwrap();
            assert_eq!(stream.header().version(), ProtocolVersion::V1);
            assert_eq!(stream.remote_addr().to_string(), "192.168.1.100:5678");
        }
    }

    mod deadline {
        use super::*;

        #[tokio::test]
        async fn stalled_header_times_out() {
            let conn = MockConn::new(
                Builder::new()
                    .read(b"PROXY TCP4 ")
                    .wait(Duration::from_secs(5))
                    .build(),
                PEER,
            );
            let acceptor = ProxyAcceptor::new(Arc::new(AllowList::Any), Duration::from_millis(50));

            let result = acceptor.accept(conn).await;
            assert!(matches!(result, Err(Error::HeaderReadTimeout)));
        }

        #[tokio::test]
        async fn untrusted_peer_never_waits() {
            let conn = MockConn::new(Builder::new().wait(Duration::from_secs(5)).build(), PEER);
            let acceptor = ProxyAcceptor::new(
                Arc::new(AllowList::parse("10.0.0.0/8").unwrap()),
                Duration::from_millis(50),
            );

            let stream = acceptor.accept(conn).await.unwrap();
            assert_eq!(stream.header(), &Header::Absent);
        }
    }

    #[test]
    fn from_config_rejects_bad_allow_list() {
        let config = ProxyProtocolConfig {
            allowed_proxy_ips: "10.0.0.0/8,bogus".to_string(),
            ..ProxyProtocolConfig::default()
        };
        assert_eq!(
            ProxyAcceptor::from_config(&config).unwrap_err(),
            ConfigError::InvalidEntry("bogus".to_string())
        );
    }

    #[test]
    fn from_config_carries_settings() {
        let config = ProxyProtocolConfig {
            allowed_proxy_ips: "10.0.0.0/8".to_string(),
            header_timeout: 2,
            require_header: true,
        };
        let acceptor = ProxyAcceptor::from_config(&config).unwrap();
        assert_eq!(acceptor.header_timeout(), Duration::from_secs(2));
        assert!(acceptor.allow_list().is_allowed("10.1.1.1".parse().unwrap()));
        assert!(acceptor.require_header);
    }
}
