use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, Context};
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

const MAX_PACKET: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// One wire exchange with one upstream nameserver. No retries at this layer;
/// the forwarder decides what to do with failures.
#[derive(Clone, Debug)]
pub struct Exchanger {
    read_timeout: Duration,
}

impl Exchanger {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }

    pub async fn exchange(
        &self,
        req: &Message,
        upstream: SocketAddr,
        transport: Transport,
    ) -> anyhow::Result<Message> {
        match transport {
            Transport::Udp => self.exchange_udp(req, upstream).await,
            Transport::Tcp => self.exchange_tcp(req, upstream).await,
        }
    }

    async fn exchange_udp(&self, req: &Message, upstream: SocketAddr) -> anyhow::Result<Message> {
        let packet = req.to_vec().context("encode query")?;
        let bind: SocketAddr = if upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let sock = UdpSocket::bind(bind).await.context("bind udp socket")?;
        sock.connect(upstream)
            .await
            .with_context(|| format!("connect to upstream {upstream}"))?;
        sock.send(&packet).await.context("send query")?;

        let mut buf = [0u8; MAX_PACKET];
        let resp = timeout(self.read_timeout, async {
            loop {
                let len = sock.recv(&mut buf).await.context("recv from upstream")?;
                // a mismatched id is a late answer to an earlier query on a
                // reused port, never ours
                if len >= 2 && buf[..2] == packet[..2] {
                    return Message::from_vec(&buf[..len]).context("decode upstream response");
                }
            }
        })
        .await
        .map_err(|_| anyhow!("upstream {upstream} timed out"))??;
        Ok(resp)
    }

    async fn exchange_tcp(&self, req: &Message, upstream: SocketAddr) -> anyhow::Result<Message> {
        let packet = req.to_vec().context("encode query")?;
        anyhow::ensure!(
            packet.len() <= u16::MAX as usize,
            "query too large for tcp framing"
        );
        let mut stream = timeout(self.read_timeout, TcpStream::connect(upstream))
            .await
            .map_err(|_| anyhow!("connect to upstream {upstream} timed out"))?
            .with_context(|| format!("connect to upstream {upstream}"))?;

        stream
            .write_all(&(packet.len() as u16).to_be_bytes())
            .await
            .context("write frame length")?;
        stream.write_all(&packet).await.context("write query")?;

        let resp = timeout(self.read_timeout, async {
            let mut len_buf = [0u8; 2];
            stream
                .read_exact(&mut len_buf)
                .await
                .context("read response length")?;
            let frame_len = u16::from_be_bytes(len_buf) as usize;
            anyhow::ensure!(frame_len > 0, "zero-length tcp frame");
            let mut buf = vec![0u8; frame_len];
            stream
                .read_exact(&mut buf)
                .await
                .context("read response body")?;
            Message::from_vec(&buf).context("decode upstream response")
        })
        .await
        .map_err(|_| anyhow!("upstream {upstream} timed out"))??;
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::{DNSClass, Name, RecordType};
    use std::str::FromStr;
    use tokio::net::TcpListener;

    fn query(zone: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x4242);
        let mut q = Query::new();
        q.set_name(Name::from_str(zone).unwrap());
        q.set_query_type(RecordType::A);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg
    }

    fn reply_to(req: &Message) -> Message {
        let mut msg = Message::new();
        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        msg.add_query(req.queries()[0].clone());
        msg
    }

    async fn spawn_udp_upstream() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET];
            while let Ok((len, peer)) = sock.recv_from(&mut buf).await {
                if let Ok(req) = Message::from_vec(&buf[..len]) {
                    let resp = reply_to(&req).to_vec().unwrap();
                    let _ = sock.send_to(&resp, peer).await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn udp_exchange_round_trips() {
        let upstream = spawn_udp_upstream().await;
        let exchanger = Exchanger::new(Duration::from_secs(2));
        let req = query("example.com.");
        let resp = exchanger
            .exchange(&req, upstream, Transport::Udp)
            .await
            .unwrap();
        assert_eq!(resp.id(), req.id());
        assert_eq!(resp.queries()[0].name(), req.queries()[0].name());
    }

    #[tokio::test]
    async fn udp_exchange_times_out_without_answer() {
        // bound socket that never answers
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = sock.local_addr().unwrap();
        let exchanger = Exchanger::new(Duration::from_millis(100));
        let req = query("example.com.");
        let err = exchanger
            .exchange(&req, upstream, Transport::Udp)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn tcp_exchange_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let req = Message::from_vec(&buf).unwrap();
            let resp = reply_to(&req).to_vec().unwrap();
            stream
                .write_all(&(resp.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&resp).await.unwrap();
        });

        let exchanger = Exchanger::new(Duration::from_secs(2));
        let req = query("example.com.");
        let resp = exchanger
            .exchange(&req, upstream, Transport::Tcp)
            .await
            .unwrap();
        assert_eq!(resp.id(), req.id());
    }
}
