//! SOCKS5 CONNECT client and acceptor (RFC 1928), with username/password
//! sub-negotiation (RFC 1929).

use proxy_types::codec::{self, MAX_ADDR_LEN};
use proxy_types::{BoundAddr, DestAddr, ToDestAddr};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const PASSWORD_NEGOTIATION_VERSION: u8 = 0x01;

/// Handshake helpers take `&mut dyn ReadWriteStream` so each message
/// read/write is compiled once instead of per stream type.
trait ReadWriteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> ReadWriteStream for S where S: AsyncRead + AsyncWrite + Unpin + Send {}

/// SOCKS5 CONNECT client.
#[derive(Debug)]
pub struct Socks5Stream<S> {
    inner: S,
    bound_addr: BoundAddr,
}

impl<S> Socks5Stream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Initiates a CONNECT request to the specified proxy.
    pub async fn connect(mut stream: S, dest: impl ToDestAddr) -> io::Result<Self> {
        let bound_addr = connect_impl(&mut stream, dest.to_dest_addr()?, AuthMethod::None).await?;

        Ok(Self {
            inner: stream,
            bound_addr,
        })
    }

    /// Initiates a CONNECT request to the specified proxy with username and password.
    pub async fn connect_with_password(
        mut stream: S,
        dest: impl ToDestAddr,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> io::Result<Self> {
        let bound_addr = connect_impl(
            &mut stream,
            dest.to_dest_addr()?,
            AuthMethod::Password {
                username: username.into(),
                password: password.into(),
            },
        )
        .await?;

        Ok(Self {
            inner: stream,
            bound_addr,
        })
    }

    /// Returns the server bound address (and port)
    ///
    /// This is the port number that the server assigned to connect to the target and
    /// the associated IP address.
    pub fn bound_addr(&self) -> &BoundAddr {
        &self.bound_addr
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncRead for Socks5Stream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for Socks5Stream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn connect_impl(stream: &mut dyn ReadWriteStream, dest: DestAddr, auth: AuthMethod) -> io::Result<BoundAddr> {
    // Client greeting
    let negotiation_request = {
        let mut methods: Vec<u8> = vec![AuthMethod::NO_AUTH_REQUIRED];
        if let AuthMethod::Password { .. } = &auth {
            methods.push(AuthMethod::USERNAME_PASSWORD);
        }
        NegotiationRequest { methods }
    };
    negotiation_request.write(stream).await?;

    // Server choice
    let negotiation_response = NegotiationResponse::read(stream).await?;

    // Actual authentication if required
    match (negotiation_response.method, auth) {
        (AuthMethod::NO_AUTH_REQUIRED, _) => {}
        (AuthMethod::USERNAME_PASSWORD, AuthMethod::Password { username, password }) => {
            client_password_authentication(stream, username, password).await?
        }
        (method, _) if !negotiation_request.methods.contains(&method) => {
            // as per RFC server should send 0xFF as method if none of the methods
            // listed by client are acceptable.
            // However some implementation ignores this (ie: CCProxy 8.0).
            return Err(io::Error::new(io::ErrorKind::Other, "no acceptable auth method"));
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "unknown / unsupported auth method",
            ))
        }
    }

    // SOCKS request
    SocksRequest {
        cmd: Command::Connect,
        dst: dest,
    }
    .write(stream)
    .await?;

    // SOCKS reply
    let socks_reply = SocksResponse::read(stream).await?;

    Ok(socks_reply.bnd)
}

/// Configuration for a SOCKS5 acceptor.
#[derive(Debug, Default)]
pub struct Socks5AcceptorConfig {
    pub no_auth_required: bool,
    /// Optional list of tuples (user / password) for password authentication
    pub users: Option<Vec<(String, String)>>,
}

/// SOCKS5 failure codes defined in RFC1928.
#[derive(Clone, Copy, Debug)]
#[repr(u8)]
pub enum Socks5FailureCode {
    GeneralSocksServerFailure = 0x01,
    ConnectionNotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl std::error::Error for Socks5FailureCode {}

impl core::fmt::Display for Socks5FailureCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Socks5FailureCode::GeneralSocksServerFailure => write!(f, "general SOCKS server failure"),
            Socks5FailureCode::ConnectionNotAllowedByRuleset => write!(f, "connection not allowed by ruleset"),
            Socks5FailureCode::NetworkUnreachable => write!(f, "network unreachable"),
            Socks5FailureCode::HostUnreachable => write!(f, "host unreachable"),
            Socks5FailureCode::ConnectionRefused => write!(f, "connection refused"),
            Socks5FailureCode::TtlExpired => write!(f, "TTL expired"),
            Socks5FailureCode::CommandNotSupported => write!(f, "command not supported"),
            Socks5FailureCode::AddressTypeNotSupported => write!(f, "address type not supported"),
        }
    }
}

impl Socks5FailureCode {
    fn to_u8(self) -> u8 {
        self as u8
    }
}

impl From<io::ErrorKind> for Socks5FailureCode {
    fn from(kind: io::ErrorKind) -> Socks5FailureCode {
        match kind {
            io::ErrorKind::ConnectionRefused => Socks5FailureCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5FailureCode::TtlExpired,
            io::ErrorKind::Unsupported => Socks5FailureCode::AddressTypeNotSupported,
            _ => Socks5FailureCode::GeneralSocksServerFailure,
        }
    }
}

impl From<io::Error> for Socks5FailureCode {
    fn from(e: io::Error) -> Socks5FailureCode {
        Socks5FailureCode::from(e.kind())
    }
}

impl From<&io::Error> for Socks5FailureCode {
    fn from(e: &io::Error) -> Socks5FailureCode {
        Socks5FailureCode::from(e.kind())
    }
}

/// SOCKS5 request acceptor for usage in proxy server.
#[derive(Debug)]
pub struct Socks5Acceptor<S> {
    inner: S,
    socks_request: SocksRequest,
}

impl<S> Socks5Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Accepts SOCKS5 stream without requiring any authentication.
    pub async fn accept(mut stream: S) -> io::Result<Self> {
        let conf = Socks5AcceptorConfig {
            no_auth_required: true,
            ..Socks5AcceptorConfig::default()
        };
        let req = accept_impl(&mut stream, &conf).await?;
        Ok(Self {
            inner: stream,
            socks_request: req,
        })
    }

    /// Accepts SOCKS5 stream using a user-defined configuration.
    pub async fn accept_with_config(mut stream: S, conf: &Socks5AcceptorConfig) -> io::Result<Self> {
        let req = accept_impl(&mut stream, conf).await?;
        Ok(Self {
            inner: stream,
            socks_request: req,
        })
    }

    /// Returns the destination address that the proxy server should connects to.
    pub fn dest_addr(&self) -> &DestAddr {
        &self.socks_request.dst
    }

    pub fn is_connect_command(&self) -> bool {
        matches!(self.socks_request.cmd, Command::Connect)
    }

    /// Sends final SOCKS reply.
    ///
    /// `bound_address` is the local address used by the proxy server to
    /// connect to the target host.
    pub async fn connected(mut self, bound_address: impl ToDestAddr) -> io::Result<S> {
        SocksResponse::success(bound_address.to_dest_addr()?)
            .write(&mut self.inner)
            .await?;
        Ok(self.inner)
    }

    /// Sends a SOCKS failure reply and consumes the stream.
    pub async fn failed(mut self, code: Socks5FailureCode) -> io::Result<()> {
        SocksResponse::failure(code).write(&mut self.inner).await
    }
}

async fn accept_impl(stream: &mut dyn ReadWriteStream, conf: &Socks5AcceptorConfig) -> io::Result<SocksRequest> {
    let negotiation_request = NegotiationRequest::read(stream).await?;

    let selected_method = negotiation_request.methods.into_iter().find(|&m| match m {
        // Prefer password authentication whenever users are configured.
        AuthMethod::USERNAME_PASSWORD if conf.users.is_some() => true,
        AuthMethod::NO_AUTH_REQUIRED if conf.no_auth_required => true,
        _ => false,
    });

    if let Some(method) = selected_method {
        NegotiationResponse::new(method).write(stream).await?;

        if method == AuthMethod::USERNAME_PASSWORD {
            // this should not panic because it is checked above
            let users = conf.users.as_deref().expect("username / password list");
            server_password_authentication(stream, users).await?;
        }
    } else {
        NegotiationResponse::new(AuthMethod::NO_ACCEPTABLE_METHODS)
            .write(stream)
            .await?;

        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no acceptable methods provided",
        ));
    }

    let socks_request = SocksRequest::read(stream).await?;

    Ok(socks_request)
}

#[derive(Clone, Copy, Debug)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

enum AuthMethod {
    Password { username: String, password: String },
    None,
}

impl AuthMethod {
    const NO_AUTH_REQUIRED: u8 = 0x00;
    const USERNAME_PASSWORD: u8 = 0x02;
    const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
}

// Negotation request (client greeting)
// +----+----------+----------+
// |VER | NMETHODS | METHODS  |
// +----+----------+----------+
// | 1  |    1     | 1 to 255 |
// +----+----------+----------+
struct NegotiationRequest {
    methods: Vec<u8>,
}

impl NegotiationRequest {
    async fn write(&self, stream: &mut dyn ReadWriteStream) -> io::Result<()> {
        let nauth = u8::try_from(self.methods.len()).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let mut packet = vec![SOCKS_VERSION, nauth];
        packet.extend_from_slice(&self.methods);
        stream.write_all(&packet).await?;
        Ok(())
    }

    async fn read(stream: &mut dyn ReadWriteStream) -> io::Result<Self> {
        let mut fixed_part = [0; 2];
        stream.read_exact(&mut fixed_part).await?;
        let [req_version, req_nmethods] = fixed_part;

        if req_version != SOCKS_VERSION {
            NegotiationResponse::new(AuthMethod::NO_ACCEPTABLE_METHODS)
                .write(stream)
                .await?;

            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid request version"));
        }

        let mut methods = vec![0; usize::from(req_nmethods)];
        stream.read_exact(&mut methods).await?;

        Ok(Self { methods })
    }
}

/// Negotiation response (server choice)
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
struct NegotiationResponse {
    method: u8,
}

impl NegotiationResponse {
    fn new(method: u8) -> Self {
        Self { method }
    }

    async fn write(&self, stream: &mut dyn ReadWriteStream) -> io::Result<()> {
        stream.write_all(&[SOCKS_VERSION, self.method]).await?;
        Ok(())
    }

    async fn read(stream: &mut dyn ReadWriteStream) -> io::Result<Self> {
        let mut buffer = [0; 2];
        stream.read_exact(&mut buffer).await?;
        let [ver, method] = buffer;

        if ver != SOCKS_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid response version"));
        }

        Ok(Self { method })
    }
}

/// SOCKS request
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
#[derive(Debug)]
struct SocksRequest {
    cmd: Command,
    dst: DestAddr,
}

impl SocksRequest {
    async fn write(&self, stream: &mut dyn ReadWriteStream) -> io::Result<()> {
        let mut packet = Vec::with_capacity(3 + MAX_ADDR_LEN);
        packet.push(SOCKS_VERSION);
        packet.push(self.cmd as u8);
        packet.push(0x00); // reserved
        codec::encode(&self.dst, &mut packet)?;

        stream.write_all(&packet).await?;

        Ok(())
    }

    async fn read(stream: &mut dyn ReadWriteStream) -> io::Result<Self> {
        if stream.read_u8().await? != SOCKS_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid request version"));
        }

        let cmd = stream.read_u8().await?;
        let cmd = match cmd {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::UdpAssociate,
            _ => return Err(io::Error::new(io::ErrorKind::Other, "unknown command")),
        };

        if stream.read_u8().await? != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid reserved byte"));
        }

        let dest_addr = read_addr(stream).await?;

        Ok(Self { cmd, dst: dest_addr })
    }
}

/// SOCKS reply
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
struct SocksResponse {
    rep: u8,
    bnd: BoundAddr,
}

impl SocksResponse {
    fn failure(code: Socks5FailureCode) -> Self {
        Self {
            rep: code.to_u8(),
            bnd: BoundAddr::Ip(SocketAddr::from(([0, 0, 0, 0], 0))),
        }
    }

    fn success(bound_address: BoundAddr) -> Self {
        Self {
            rep: 0x00,
            bnd: bound_address,
        }
    }

    async fn write(&self, stream: &mut dyn ReadWriteStream) -> io::Result<()> {
        let mut packet = Vec::with_capacity(3 + MAX_ADDR_LEN);
        packet.push(SOCKS_VERSION);
        packet.push(self.rep);
        packet.push(0x00); // reserved
        codec::encode(&self.bnd, &mut packet)?;

        stream.write_all(&packet).await?;

        Ok(())
    }

    async fn read(stream: &mut dyn ReadWriteStream) -> io::Result<Self> {
        if stream.read_u8().await? != SOCKS_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid response version"));
        }

        let rep = stream.read_u8().await?;

        match rep {
            0 => {} // succeeded
            1 => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    Socks5FailureCode::GeneralSocksServerFailure,
                ))
            }
            2 => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    Socks5FailureCode::ConnectionNotAllowedByRuleset,
                ))
            }
            3 => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    Socks5FailureCode::NetworkUnreachable,
                ))
            }
            4 => return Err(io::Error::new(io::ErrorKind::Other, Socks5FailureCode::HostUnreachable)),
            5 => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    Socks5FailureCode::ConnectionRefused,
                ))
            }
            6 => return Err(io::Error::new(io::ErrorKind::TimedOut, Socks5FailureCode::TtlExpired)),
            7 => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    Socks5FailureCode::CommandNotSupported,
                ))
            }
            8 => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    Socks5FailureCode::AddressTypeNotSupported,
                ))
            }
            _ => return Err(io::Error::new(io::ErrorKind::Other, "unknown SOCKS error")),
        }

        if stream.read_u8().await? != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid reserved byte"));
        }

        let bound_addr = read_addr(stream).await?;

        Ok(Self { rep, bnd: bound_addr })
    }
}

/// Reads one RFC 1928 address field off the stream.
///
/// The ATYP byte (plus the length byte for domains) tells how many bytes
/// the field still needs; the assembled buffer is then handed to the
/// shared slice codec.
async fn read_addr(stream: &mut dyn ReadWriteStream) -> io::Result<DestAddr> {
    let mut buf = Vec::with_capacity(MAX_ADDR_LEN);

    buf.push(stream.read_u8().await?);

    let remaining = match buf[0] {
        codec::ATYP_IPV4 => 4 + 2,
        codec::ATYP_IPV6 => 16 + 2,
        codec::ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            buf.push(len);
            usize::from(len) + 2
        }
        _ => 0, // let the codec report the unknown tag
    };

    buf.resize(buf.len() + remaining, 0);
    let fixed_part = if buf[0] == codec::ATYP_DOMAIN { 2 } else { 1 };
    stream.read_exact(&mut buf[fixed_part..]).await?;

    match codec::decode(&buf)? {
        Some((addr, _)) => Ok(addr),
        None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated address field")),
    }
}

async fn client_password_authentication(
    stream: &mut dyn ReadWriteStream,
    username: String,
    password: String,
) -> io::Result<()> {
    PasswordNegotiationRequest { username, password }.write(stream).await?;

    let rsp = PasswordNegotiationResponse::read(stream).await?;

    if rsp.status != 0 {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "password authentication failed",
        ));
    }

    Ok(())
}

async fn server_password_authentication(stream: &mut dyn ReadWriteStream, users: &[(String, String)]) -> io::Result<()> {
    const STATUS_SUCCESS: u8 = 0x00;
    const STATUS_FAILURE: u8 = 0x01;

    let req = PasswordNegotiationRequest::read(stream).await?;

    let success = users
        .iter()
        .any(|(usr, pwd)| usr.eq(&req.username) & constant_time_eq(pwd.as_bytes(), req.password.as_bytes()));

    if success {
        PasswordNegotiationResponse { status: STATUS_SUCCESS }
            .write(stream)
            .await?;
    } else {
        PasswordNegotiationResponse { status: STATUS_FAILURE }
            .write(stream)
            .await?;

        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "password authentication failed",
        ));
    };

    Ok(())
}

/// Secret comparison that does not early-return on the first mismatching
/// byte. Lengths are still allowed to differ (and to short-circuit): the
/// length of the stored secret is not considered sensitive.
fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    use subtle::ConstantTimeEq as _;

    lhs.ct_eq(rhs).into()
}

// https://datatracker.ietf.org/doc/html/rfc1929
// +----+------+----------+------+----------+
// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
// +----+------+----------+------+----------+
// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
// +----+------+----------+------+----------+
struct PasswordNegotiationRequest {
    username: String,
    password: String,
}

impl PasswordNegotiationRequest {
    async fn write(&self, stream: &mut dyn ReadWriteStream) -> io::Result<()> {
        let username_len = match u8::try_from(self.username.len()) {
            Ok(len) if len > 0 => len,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid username")),
        };

        let password_len = match u8::try_from(self.password.len()) {
            Ok(len) if len > 0 => len,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid password")),
        };

        let mut packet = Vec::with_capacity(3 + self.username.len() + self.password.len());
        packet.push(PASSWORD_NEGOTIATION_VERSION);
        packet.push(username_len);
        packet.extend_from_slice(self.username.as_bytes());
        packet.push(password_len);
        packet.extend_from_slice(self.password.as_bytes());

        stream.write_all(&packet).await?;

        Ok(())
    }

    async fn read(stream: &mut dyn ReadWriteStream) -> io::Result<Self> {
        if stream.read_u8().await? != PASSWORD_NEGOTIATION_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid response version"));
        }

        let username_len = usize::from(stream.read_u8().await?);
        let mut username = vec![0; username_len];
        stream.read_exact(&mut username).await?;
        let username = String::from_utf8(username)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad utf8 for username"))?;

        let password_len = usize::from(stream.read_u8().await?);
        let mut password = vec![0; password_len];
        stream.read_exact(&mut password).await?;
        let password = String::from_utf8(password)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad utf8 for password"))?;

        Ok(Self { username, password })
    }
}

/// https://datatracker.ietf.org/doc/html/rfc1929
/// +----+--------+
/// |VER | STATUS |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
struct PasswordNegotiationResponse {
    status: u8,
}

impl PasswordNegotiationResponse {
    async fn read(stream: &mut dyn ReadWriteStream) -> io::Result<Self> {
        let mut buffer = [0; 2];
        stream.read_exact(&mut buffer).await?;
        let [ver, status] = buffer;

        if ver != PASSWORD_NEGOTIATION_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid response version"));
        }

        Ok(Self { status })
    }

    async fn write(&self, stream: &mut dyn ReadWriteStream) -> io::Result<()> {
        let packet = [PASSWORD_NEGOTIATION_VERSION, self.status];
        stream.write_all(&packet).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOGLE_ADDR: &str = "google.com:80";

    fn socks5_dummy() -> tokio_test::io::Mock {
        tokio_test::io::Builder::new()
            .write(&[5, 2, AuthMethod::NO_AUTH_REQUIRED, AuthMethod::USERNAME_PASSWORD])
            .read(&[5, AuthMethod::USERNAME_PASSWORD])
            .build()
    }

    #[tokio::test]
    async fn invalid_username() {
        let err = Socks5Stream::connect_with_password(socks5_dummy(), GOOGLE_ADDR, "", "x".repeat(255))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(err.to_string(), "invalid username");

        let err = Socks5Stream::connect_with_password(socks5_dummy(), GOOGLE_ADDR, "x".repeat(256), "x".repeat(255))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(err.to_string(), "invalid username");
    }

    #[tokio::test]
    async fn invalid_password() {
        let err = Socks5Stream::connect_with_password(socks5_dummy(), GOOGLE_ADDR, "x".repeat(255), "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(err.to_string(), "invalid password");
    }

    #[tokio::test]
    async fn client_connect_happy_path() {
        // greeting / choice / request / reply, then 5 payload bytes echoed.
        let mock = tokio_test::io::Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&[5, 1, 0, 1, 192, 168, 1, 1, 0, 80])
            .read(&[5, 0, 0, 1, 192, 168, 1, 1, 0, 80])
            .write(&[1, 2, 3, 4, 5])
            .read(&[1, 2, 3, 4, 5])
            .build();

        let mut stream = Socks5Stream::connect(mock, "192.168.1.1:80").await.unwrap();
        assert_eq!(stream.bound_addr(), &"192.168.1.1:80".to_dest_addr().unwrap());

        stream.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, [1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn client_maps_connection_refused() {
        let mock = tokio_test::io::Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&[5, 1, 0, 3, 10, b's', b'w', b'i', b'f', b't', b'.', b'o', b'r', b'g', b'x', 1, 187])
            .read(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();

        let err = Socks5Stream::connect(mock, "swift.orgx:443").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn acceptor_happy_path() {
        let mock = tokio_test::io::Builder::new()
            .read(&[5, 1, 0])
            .write(&[5, 0])
            .read(&[5, 1, 0, 1, 192, 168, 1, 1, 0, 80])
            .write(&[5, 0, 0, 1, 192, 168, 1, 1, 0, 80])
            .build();

        let acceptor = Socks5Acceptor::accept(mock).await.unwrap();
        assert!(acceptor.is_connect_command());
        assert_eq!(acceptor.dest_addr(), &"192.168.1.1:80".to_dest_addr().unwrap());

        acceptor.connected("192.168.1.1:80").await.unwrap();
    }

    #[tokio::test]
    async fn acceptor_rejects_unacceptable_methods() {
        let mock = tokio_test::io::Builder::new()
            .read(&[5, 1, 0x02]) // only username/password, but no users configured
            .write(&[5, 0xFF])
            .build();

        let err = Socks5Acceptor::accept(mock).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn acceptor_password_authentication() {
        let conf = Socks5AcceptorConfig {
            no_auth_required: false,
            users: Some(vec![("user".to_owned(), "pass".to_owned())]),
        };

        let mock = tokio_test::io::Builder::new()
            .read(&[5, 2, 0x00, 0x02])
            .write(&[5, 0x02])
            .read(&[1, 4, b'u', b's', b'e', b'r', 4, b'p', b'a', b's', b's'])
            .write(&[1, 0])
            .read(&[5, 1, 0, 3, 9, b's', b'w', b'i', b'f', b't', b'.', b'o', b'r', b'g', 1, 187])
            .write(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();

        let acceptor = Socks5Acceptor::accept_with_config(mock, &conf).await.unwrap();
        assert_eq!(acceptor.dest_addr(), &DestAddr::Domain("swift.org".to_owned(), 443));
        acceptor.connected("0.0.0.0:0").await.unwrap();
    }

    #[tokio::test]
    async fn acceptor_bad_password_is_rejected() {
        let conf = Socks5AcceptorConfig {
            no_auth_required: false,
            users: Some(vec![("user".to_owned(), "pass".to_owned())]),
        };

        let mock = tokio_test::io::Builder::new()
            .read(&[5, 1, 0x02])
            .write(&[5, 0x02])
            .read(&[1, 4, b'u', b's', b'e', b'r', 4, b'n', b'o', b'p', b'e'])
            .write(&[1, 1])
            .build();

        let err = Socks5Acceptor::accept_with_config(mock, &conf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn constant_time_comparison() {
        assert!(constant_time_eq(b"hunter2", b"hunter2"));
        assert!(!constant_time_eq(b"hunter2", b"hunter3"));
        assert!(!constant_time_eq(b"hunter2", b"hunter22"));
        assert!(constant_time_eq(b"", b""));
    }
}
