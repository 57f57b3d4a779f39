//! A loopback HTTP listener that receives the authorization response

use std::{io, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use url::Url;

const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// How long a connection may take to deliver its request
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

const NOT_FOUND_HTML: &str = "<html><body>Not found</body></html>";

/// Listens on the redirect URI for the identity provider's authorization response
#[derive(Debug)]
pub struct RedirectListener {
    listener: TcpListener,
    path: String,
}

struct CallbackRequest {
    path: String,
    query: Option<String>,
    body: Vec<u8>,
}

impl RedirectListener {
    /// Binds to the host and port named in `redirect_uri`
    pub async fn bind(redirect_uri: &Url) -> io::Result<Self> {
        let host = redirect_uri
            .host_str()
            .ok_or_else(|| invalid_input("redirect URI has no host"))?;
        let port = redirect_uri
            .port_or_known_default()
            .ok_or_else(|| invalid_input("redirect URI has no port"))?;

        let listener = TcpListener::bind((host.trim_matches(&['[', ']'][..]), port)).await?;
        tracing::debug!(
            local_addr = %listener.local_addr()?,
            path = redirect_uri.path(),
            "listening for authorization response"
        );

        Ok(Self {
            listener,
            path: redirect_uri.path().to_owned(),
        })
    }

    /// The local address the listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for a request to the redirect path, answering it with `html`
    ///
    /// Requests to any other path receive a 404 and are otherwise ignored.
    /// Connections are read concurrently, so an idle connection does not hold
    /// up the callback. Returns the form body of the request if it has one,
    /// otherwise its query string.
    pub async fn receive_callback(&self, html: &str) -> io::Result<String> {
        let mut pending = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    pending.spawn(read_connection(stream, peer));
                }
                Some(joined) = pending.join_next() => {
                    let Ok((mut stream, peer, request)) = joined else {
                        continue;
                    };

                    let request = match request {
                        Ok(request) => request,
                        Err(error) => {
                            tracing::debug!(%peer, %error, "ignoring malformed request");
                            continue;
                        }
                    };

                    if request.path != self.path {
                        tracing::debug!(%peer, path = %request.path, "ignoring request to unexpected path");
                        if let Err(error) = write_response(&mut stream, "404 Not Found", NOT_FOUND_HTML).await {
                            tracing::debug!(%peer, %error, "unable to answer stray request");
                        }
                        continue;
                    }

                    if let Err(error) = write_response(&mut stream, "200 OK", html).await {
                        tracing::warn!(%peer, %error, "unable to answer authorization response");
                    }

                    let payload = if request.body.is_empty() {
                        request.query.unwrap_or_default()
                    } else {
                        String::from_utf8_lossy(&request.body).into_owned()
                    };

                    return Ok(payload);
                }
            }
        }
    }
}

async fn read_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
) -> (TcpStream, SocketAddr, io::Result<CallbackRequest>) {
    let request = match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request(&mut stream)).await
    {
        Ok(request) => request,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "request not received in time",
        )),
    };
    (stream, peer, request)
}

async fn read_request(stream: &mut TcpStream) -> io::Result<CallbackRequest> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(invalid_data("connection closed before request was complete"));
        }
        buffer.extend_from_slice(&chunk[..read]);

        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_SIZE {
            return Err(invalid_data("request headers too large"));
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| invalid_data("request line missing"))?;
    let mut parts = request_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| invalid_data("request method missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| invalid_data("request target missing"))?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    };

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.trim().parse::<usize>())
        .transpose()
        .map_err(|_| invalid_data("invalid content length"))?
        .unwrap_or(0);

    if content_length > MAX_REQUEST_SIZE {
        return Err(invalid_data("request body too large"));
    }

    let mut body = buffer.split_off(header_end + 4);
    while body.len() < content_length {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(invalid_data("connection closed before body was complete"));
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CallbackRequest { path, query, body })
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response(stream: &mut TcpStream, status: &str, body: &str) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn invalid_input(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_loopback() -> (RedirectListener, String) {
        let uri = Url::parse("http://127.0.0.1:0/callback").unwrap();
        let listener = RedirectListener::bind(&uri).await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    #[tokio::test]
    async fn returns_query_string_of_redirect() {
        let (listener, base) = bind_loopback().await;

        let request = tokio::spawn(async move {
            reqwest::get(format!("{base}/callback?code=abc&state=xyz"))
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        });

        let payload = listener.receive_callback("<p>done</p>").await.unwrap();
        assert_eq!(payload, "code=abc&state=xyz");
        assert_eq!(request.await.unwrap(), "<p>done</p>");
    }

    #[tokio::test]
    async fn returns_form_body_of_post() {
        let (listener, base) = bind_loopback().await;

        tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("{base}/callback"))
                .header("content-type", "application/x-www-form-urlencoded")
                .body("code=abc&state=xyz")
                .send()
                .await
                .unwrap();
        });

        let payload = listener.receive_callback("ok").await.unwrap();
        assert_eq!(payload, "code=abc&state=xyz");
    }

    #[tokio::test]
    async fn other_paths_get_not_found() {
        let (listener, base) = bind_loopback().await;

        let request = tokio::spawn(async move {
            let favicon = reqwest::get(format!("{base}/favicon.ico")).await.unwrap();
            let callback = reqwest::get(format!("{base}/callback?code=1")).await.unwrap();
            (favicon.status().as_u16(), callback.status().as_u16())
        });

        let payload = listener.receive_callback("ok").await.unwrap();
        assert_eq!(payload, "code=1");
        assert_eq!(request.await.unwrap(), (404, 200));
    }

    #[tokio::test]
    async fn idle_connection_does_not_hold_up_callback() {
        let (listener, base) = bind_loopback().await;
        let _idle = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();

        tokio::spawn(async move {
            reqwest::get(format!("{base}/callback?code=abc")).await.unwrap();
        });

        let payload = tokio::time::timeout(Duration::from_secs(3), listener.receive_callback("ok"))
            .await
            .expect("callback should be handled while another connection idles")
            .unwrap();
        assert_eq!(payload, "code=abc");
    }

    #[tokio::test]
    async fn abandoned_stray_request_does_not_end_the_wait() {
        let (listener, base) = bind_loopback().await;
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            for _ in 0..3 {
                let mut stray = TcpStream::connect(addr).await.unwrap();
                stray
                    .write_all(b"GET /favicon.ico HTTP/1.1\r\nHost: localhost\r\n\r\n")
                    .await
                    .unwrap();
                drop(stray);
            }
            reqwest::get(format!("{base}/callback?code=late")).await.unwrap();
        });

        let payload = listener.receive_callback("ok").await.unwrap();
        assert_eq!(payload, "code=late");
        client.await.unwrap();
    }
}
