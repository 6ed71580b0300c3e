// Copyright 2015-2021 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use futures_util::FutureExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{ServerError, ServerErrorKind},
    proto::{
        op::{Header, Message, MessageType, ResponseCode},
        serialize::binary::{BinDecodable, BinDecoder},
    },
    server::{Protocol, Request, RequestHandler},
};

/// Largest datagram that is read from a UDP socket
const MAX_RECEIVE_BUFFER_SIZE: usize = 4096;

/// A Futures based implementation of a DNS server
pub struct ServerFuture<T: RequestHandler> {
    handler: Arc<T>,
    join_set: JoinSet<Result<(), ServerError>>,
    shutdown_token: CancellationToken,
}

impl<T: RequestHandler> ServerFuture<T> {
    /// Creates a new ServerFuture with the specified Handler.
    pub fn new(handler: T) -> Self {
        Self {
            handler: Arc::new(handler),
            join_set: JoinSet::new(),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Register a UDP socket. Should be bound before calling this function.
    pub fn register_socket(&mut self, socket: net::UdpSocket) {
        debug!("registering udp: {:?}", socket);

        let socket = Arc::new(socket);
        let shutdown = self.shutdown_token.clone();
        let handler = self.handler.clone();

        self.join_set.spawn(async move {
            let mut inner_join_set = JoinSet::new();
            let mut buf = [0u8; MAX_RECEIVE_BUFFER_SIZE];
            loop {
                let (len, src_addr) = tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("error receiving message on udp_socket: {}", e);
                            if is_unrecoverable_socket_error(&e) {
                                break;
                            }
                            continue;
                        }
                    },
                    _ = shutdown.cancelled() => break,
                };

                debug!("received udp request from: {}", src_addr);

                // verify that the src address is safe for responses
                if let Err(e) = sanitize_src_address(src_addr) {
                    warn!("address can not be responded to {src_addr}: {e}");
                    continue;
                }

                let bytes = buf[..len].to_vec();
                let handler = handler.clone();
                let socket = socket.clone();

                inner_join_set.spawn(async move {
                    let Some(response) =
                        handle_raw_request(&bytes, src_addr, Protocol::Udp, &*handler)
                    else {
                        return;
                    };

                    if let Err(e) = socket.send_to(&response, src_addr).await {
                        warn!("error sending udp response to {src_addr}: {e}");
                    }
                });

                reap_tasks(&mut inner_join_set);
            }

            if shutdown.is_cancelled() {
                Ok(())
            } else {
                Err(ServerErrorKind::UnexpectedClose("UDP socket").into())
            }
        });
    }

    /// Register a UDP socket. Should be bound before calling this function.
    pub fn register_socket_std(&mut self, socket: std::net::UdpSocket) -> io::Result<()> {
        socket.set_nonblocking(true)?;
        self.register_socket(net::UdpSocket::from_std(socket)?);
        Ok(())
    }

    /// Register a TcpListener to the Server. This should already be bound to either an IPv6 or an
    ///  IPv4 address.
    ///
    /// # Arguments
    /// * `listener` - a bound TCP socket
    /// * `timeout` - timeout duration of incoming requests, any connection that does not send
    ///               a complete request within this time period will be closed.
    pub fn register_listener(&mut self, listener: net::TcpListener, timeout: Duration) {
        debug!("register tcp: {:?}", listener);

        let handler = self.handler.clone();

        // for each incoming request...
        let shutdown = self.shutdown_token.clone();
        self.join_set.spawn(async move {
            let mut inner_join_set = JoinSet::new();
            loop {
                let (tcp_stream, src_addr) = tokio::select! {
                    tcp_stream = listener.accept() => match tcp_stream {
                        Ok((t, s)) => (t, s),
                        Err(e) => {
                            debug!("error receiving TCP tcp_stream error: {}", e);
                            if is_unrecoverable_socket_error(&e) {
                                break;
                            }
                            continue;
                        },
                    },
                    _ = shutdown.cancelled() => {
                        // A graceful shutdown was initiated. Break out of the loop.
                        break;
                    },
                };

                // verify that the src address is safe for responses
                if let Err(e) = sanitize_src_address(src_addr) {
                    warn!("address can not be responded to {src_addr}: {e}");
                    continue;
                }

                let handler = handler.clone();

                inner_join_set.spawn(async move {
                    debug!("accepted request from: {}", src_addr);
                    if let Err(e) =
                        handle_tcp_connection(tcp_stream, src_addr, timeout, &*handler).await
                    {
                        debug!("error in TCP request_stream src: {} error: {}", src_addr, e);
                    }
                });

                reap_tasks(&mut inner_join_set);
            }

            if shutdown.is_cancelled() {
                Ok(())
            } else {
                Err(ServerErrorKind::UnexpectedClose("TCP listener").into())
            }
        });
    }

    /// Register a TcpListener to the Server, see [`Self::register_listener`]
    pub fn register_listener_std(
        &mut self,
        listener: std::net::TcpListener,
        timeout: Duration,
    ) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        self.register_listener(net::TcpListener::from_std(listener)?, timeout);
        Ok(())
    }

    /// Returns a token that is cancelled once [`Self::shutdown_gracefully`] is called
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// Triggers a graceful shutdown the server. All background tasks will stop accepting
    /// new connections and the returned future will complete once all tasks have terminated.
    pub async fn shutdown_gracefully(&mut self) -> Result<(), ServerError> {
        self.shutdown_token.cancel();

        // Wait for the server to complete.
        block_until_done(&mut self.join_set).await
    }

    /// This will run until all background tasks complete. If one or more tasks return an error,
    /// one will be chosen as the returned error for this future.
    pub async fn block_until_done(&mut self) -> Result<(), ServerError> {
        block_until_done(&mut self.join_set).await
    }
}

async fn block_until_done(
    join_set: &mut JoinSet<Result<(), ServerError>>,
) -> Result<(), ServerError> {
    if join_set.is_empty() {
        warn!("block_until_done called with no pending tasks");
        return Ok(());
    }

    // Now wait for all of the tasks to complete.
    let mut out = Ok(());
    while let Some(join_result) = join_set.join_next().await {
        match join_result {
            Ok(Ok(())) => (),
            // Save the last error.
            Ok(Err(e)) => out = Err(e),
            Err(e) => return Err(e.into()),
        }
    }
    out
}

/// Reap finished tasks from a `JoinSet`, without awaiting or blocking.
fn reap_tasks(join_set: &mut JoinSet<()>) {
    while FutureExt::now_or_never(join_set.join_next())
        .flatten()
        .is_some()
    {}
}

/// Serves length prefixed messages on one connection until the client closes it or goes idle
async fn handle_tcp_connection<T: RequestHandler>(
    mut stream: net::TcpStream,
    src_addr: SocketAddr,
    timeout: Duration,
    handler: &T,
) -> io::Result<()> {
    loop {
        let len = match tokio::time::timeout(timeout, stream.read_u16()).await {
            Err(_) => {
                debug!("closing idle TCP connection from {src_addr}");
                return Ok(());
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(len) => len?,
        };

        let mut bytes = vec![0; usize::from(len)];
        tokio::time::timeout(timeout, stream.read_exact(&mut bytes))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out reading request"))??;

        // we don't spawn here to limit clients from getting too many resources
        let Some(response) = handle_raw_request(&bytes, src_addr, Protocol::Tcp, handler) else {
            continue;
        };

        let Ok(len) = u16::try_from(response.len()) else {
            warn!(
                "response to {src_addr} is too large for TCP: {} bytes",
                response.len()
            );
            continue;
        };

        stream.write_u16(len).await?;
        stream.write_all(&response).await?;
        stream.flush().await?;
    }
}

/// Decodes `message_bytes`, hands the request to `request_handler` and encodes its response.
///
/// Returns `None` if nothing should be sent back.
pub(crate) fn handle_raw_request<T: RequestHandler>(
    message_bytes: &[u8],
    src_addr: SocketAddr,
    protocol: Protocol,
    request_handler: &T,
) -> Option<Vec<u8>> {
    let message = match Message::from_vec(message_bytes) {
        Ok(message) => message,
        Err(error) => return form_error(message_bytes, src_addr, protocol, &error.to_string()),
    };

    if message.message_type() == MessageType::Response {
        // Don't process response messages to avoid DoS attacks from reflection.
        debug!("dropping response message from {src_addr}");
        return None;
    }

    let id = message.id();
    let (query, qtype) = message
        .queries()
        .first()
        .map(|q| (q.name().to_string(), q.query_type().to_string()))
        .unwrap_or_default();

    debug!(
        "request:{id} src:{proto}://{addr}#{port} {op:?}:{query}:{qtype} queries:{queries}",
        proto = protocol,
        addr = src_addr.ip(),
        port = src_addr.port(),
        op = message.op_code(),
        queries = message.queries().len(),
    );

    let max_payload = message.max_payload();
    let request = Request::new(message, src_addr, protocol);
    let mut response = request_handler.handle_request(&request)?;

    if id != response.id() {
        warn!("request id:{id} does not match response id:{}", response.id());
    }

    info!(
        "request:{id} src:{proto}://{addr}#{port} {query}:{qtype} response:{code} answers:{answers}",
        proto = protocol,
        addr = src_addr.ip(),
        port = src_addr.port(),
        code = response.response_code(),
        answers = response.answers().len(),
    );

    let mut bytes = encode(&response)?;
    if protocol.is_datagram() && bytes.len() > usize::from(max_payload) {
        debug!(
            "truncating response:{id} of {} bytes to fit {max_payload}",
            bytes.len()
        );
        response.take_answers();
        response.set_truncated(true);
        bytes = encode(&response)?;
    }

    Some(bytes)
}

/// Answers an undecodable query with `FormErr`, if at least its header could be read
fn form_error(
    message_bytes: &[u8],
    src_addr: SocketAddr,
    protocol: Protocol,
    error: &str,
) -> Option<Vec<u8>> {
    let header = match Header::read(&mut BinDecoder::new(message_bytes)) {
        Ok(header) => header,
        Err(e) => {
            debug!("dropping unreadable message from {src_addr}: {e}");
            return None;
        }
    };

    debug!(
        "request:{id} src:{proto}://{addr}#{port} {op:?}:FormErr:{error}",
        id = header.id(),
        proto = protocol,
        addr = src_addr.ip(),
        port = src_addr.port(),
        op = header.op_code(),
    );

    if header.message_type() == MessageType::Response {
        return None;
    }

    encode(&Message::error_msg(
        header.id(),
        header.op_code(),
        ResponseCode::FormErr,
    ))
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("error encoding response:{}: {e}", message.id());
            None
        }
    }
}

/// Checks if the IP address is safe for returning messages
///
/// Examples of unsafe addresses are any with a port of `0`
///
/// # Returns
///
/// Error if the address should not be used for returned requests
fn sanitize_src_address(src: SocketAddr) -> Result<(), String> {
    // currently checks that the src address aren't either the undefined IPv4 or IPv6 address, and not port 0.
    if src.port() == 0 {
        return Err(format!("cannot respond to src on port 0: {src}"));
    }

    fn verify_v4(src: Ipv4Addr) -> Result<(), String> {
        if src.is_unspecified() {
            return Err(format!("cannot respond to unspecified v4 addr: {src}"));
        }

        if src.is_broadcast() {
            return Err(format!("cannot respond to broadcast v4 addr: {src}"));
        }

        Ok(())
    }

    fn verify_v6(src: Ipv6Addr) -> Result<(), String> {
        if src.is_unspecified() {
            return Err(format!("cannot respond to unspecified v6 addr: {src}"));
        }

        Ok(())
    }

    match src.ip() {
        IpAddr::V4(v4) => verify_v4(v4),
        IpAddr::V6(v6) => verify_v6(v6),
    }
}

fn is_unrecoverable_socket_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use tokio::net::{TcpListener, TcpStream, UdpSocket};
    use tokio::time::timeout;

    use super::*;
    use crate::fqdn::Fqdn;
    use crate::proto::op::{OpCode, Query};
    use crate::proto::rr::{Name, RData, Record, RecordType};
    use crate::resolver::Resolver;
    use crate::store::{RecordKind, RecordStore};

    fn resolver() -> Resolver {
        let store = RecordStore::new([Fqdn::new("example.com.").unwrap()]);
        store
            .update(
                &Fqdn::new("www.example.com.").unwrap(),
                RecordKind::V4,
                "1.2.3.4",
            )
            .unwrap();
        Resolver::new(Arc::new(store))
    }

    fn query_bytes(id: u16, name: &str, record_type: RecordType) -> Vec<u8> {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .add_query(Query::query(Name::from_str(name).unwrap(), record_type));
        message.to_vec().unwrap()
    }

    fn src() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5353))
    }

    /// Answers every question with a fixed set of records
    struct ManyAnswers(usize);

    impl RequestHandler for ManyAnswers {
        fn handle_request(&self, request: &Request) -> Option<Message> {
            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .add_queries(request.queries().iter().cloned());
            for i in 0..self.0 {
                response.add_answer(Record::from_rdata(
                    request.queries()[0].name().clone(),
                    300,
                    RData::A(Ipv4Addr::new(10, 0, 0, i as u8).into()),
                ));
            }
            Some(response)
        }
    }

    #[test]
    fn test_handle_raw_request() {
        let bytes = handle_raw_request(
            &query_bytes(11, "www.example.com.", RecordType::A),
            src(),
            Protocol::Udp,
            &resolver(),
        )
        .unwrap();

        let response = Message::from_vec(&bytes).unwrap();
        assert_eq!(response.id(), 11);
        assert_eq!(response.answers().len(), 1);
        assert_eq!(
            response.answers()[0].data(),
            Some(&RData::A(Ipv4Addr::new(1, 2, 3, 4).into()))
        );
    }

    #[test]
    fn test_form_error_for_garbage() {
        // a valid query header claiming one question, followed by a truncated question
        let mut bytes = query_bytes(99, "www.example.com.", RecordType::A);
        bytes.truncate(16);

        let response = handle_raw_request(&bytes, src(), Protocol::Udp, &resolver()).unwrap();
        let response = Message::from_vec(&response).unwrap();
        assert_eq!(response.id(), 99);
        assert_eq!(response.response_code(), ResponseCode::FormErr);

        // not even a header
        assert!(handle_raw_request(&[1, 2, 3], src(), Protocol::Udp, &resolver()).is_none());
    }

    #[test]
    fn test_truncation_over_udp() {
        let request = query_bytes(5, "www.example.com.", RecordType::A);

        let udp = handle_raw_request(&request, src(), Protocol::Udp, &ManyAnswers(64)).unwrap();
        let udp = Message::from_vec(&udp).unwrap();
        assert!(udp.truncated());
        assert!(udp.answers().is_empty());
        assert_eq!(udp.queries().len(), 1);

        let tcp = handle_raw_request(&request, src(), Protocol::Tcp, &ManyAnswers(64)).unwrap();
        let tcp = Message::from_vec(&tcp).unwrap();
        assert!(!tcp.truncated());
        assert_eq!(tcp.answers().len(), 64);
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();

        let mut server_future = ServerFuture::new(resolver());
        server_future.register_socket(socket);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(
                &query_bytes(1234, "www.example.com.", RecordType::A),
                server_addr,
            )
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("timed out waiting for the response")
            .unwrap();

        let response = Message::from_vec(&buf[..len]).unwrap();
        assert_eq!(response.id(), 1234);
        assert_eq!(response.answers().len(), 1);

        timeout(Duration::from_secs(2), server_future.shutdown_gracefully())
            .await
            .expect("timed out waiting for the server to complete")
            .expect("error while awaiting tasks");
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let mut server_future = ServerFuture::new(resolver());
        server_future.register_listener(listener, Duration::from_secs(5));

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        for id in [1u16, 2] {
            let request = query_bytes(id, "www.example.com.", RecordType::A);
            client.write_u16(request.len() as u16).await.unwrap();
            client.write_all(&request).await.unwrap();

            let len = client.read_u16().await.unwrap();
            let mut buf = vec![0; usize::from(len)];
            client.read_exact(&mut buf).await.unwrap();

            let response = Message::from_vec(&buf).unwrap();
            assert_eq!(response.id(), id);
            assert_eq!(response.answers().len(), 1);
        }
        drop(client);

        timeout(Duration::from_secs(2), server_future.shutdown_gracefully())
            .await
            .expect("timed out waiting for the server to complete")
            .expect("error while awaiting tasks");
    }

    #[tokio::test]
    async fn graceful_shutdown() {
        let mut server_future = ServerFuture::new(resolver());
        server_future.register_socket(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        server_future.register_listener(
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
            Duration::from_secs(1),
        );

        timeout(Duration::from_secs(2), server_future.shutdown_gracefully())
            .await
            .expect("timed out waiting for the server to complete")
            .expect("error while awaiting tasks");
        assert!(server_future.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn task_errors_are_returned() {
        let mut server_future = ServerFuture::new(resolver());
        server_future
            .join_set
            .spawn(async { Err(ServerErrorKind::UnexpectedClose("UDP socket").into()) });

        let err = server_future.block_until_done().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            ServerErrorKind::UnexpectedClose("UDP socket")
        ));
        assert_eq!(err.to_string(), "unexpected close of UDP socket");

        let mut server_future = ServerFuture::new(resolver());
        server_future
            .join_set
            .spawn(std::future::pending::<Result<(), ServerError>>());
        server_future.join_set.abort_all();

        let err = server_future.block_until_done().await.unwrap_err();
        assert!(matches!(err.kind(), ServerErrorKind::Join(_)));
    }

    #[test]
    fn test_sanitize_src_addr() {
        // ipv4 tests
        assert!(sanitize_src_address(SocketAddr::from(([192, 168, 1, 1], 4096))).is_ok());
        assert!(sanitize_src_address(SocketAddr::from(([127, 0, 0, 1], 53))).is_ok());

        assert!(sanitize_src_address(SocketAddr::from(([0, 0, 0, 0], 0))).is_err());
        assert!(sanitize_src_address(SocketAddr::from(([192, 168, 1, 1], 0))).is_err());
        assert!(sanitize_src_address(SocketAddr::from(([0, 0, 0, 0], 4096))).is_err());
        assert!(sanitize_src_address(SocketAddr::from(([255, 255, 255, 255], 4096))).is_err());

        // ipv6 tests
        assert!(
            sanitize_src_address(SocketAddr::from(([0x20, 0, 0, 0, 0, 0, 0, 0x1], 4096))).is_ok()
        );
        assert!(sanitize_src_address(SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], 4096))).is_err());
        assert!(
            sanitize_src_address(SocketAddr::from(([0x20, 0, 0, 0, 0, 0, 0, 0x1], 0))).is_err()
        );
    }
}
