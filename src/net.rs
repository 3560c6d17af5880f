//! A small outbound HTTPS client for server-side file fetches
//! (`uploadFromUrl`). Trimmed from the teacher's `SimpleHttp`/`HttpsConnector`
//! pair: no proxy/CONNECT-tunnel support, since the broker only ever fetches
//! URLs a caller handed it directly.

use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{format_err, Error};
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{Request, Response};
use hyper::client::connect::{Connected, Connection};
use hyper::client::{Client, HttpConnector};
use hyper::{Body, Uri};
use openssl::ssl::{SslConnector, SslMethod};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

pub struct OutboundHttp {
    client: Client<HttpsConnector, Body>,
}

impl OutboundHttp {
    pub fn new() -> Result<Self, Error> {
        let ssl_connector = SslConnector::builder(SslMethod::tls())?.build();
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        let https = HttpsConnector { connector: http_connector, ssl_connector };
        Ok(OutboundHttp { client: Client::builder().build(https) })
    }

    pub async fn get(&self, uri: &str) -> Result<Response<Body>, Error> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(hyper::header::USER_AGENT, "gemini-broker/1.0")
            .body(Body::empty())?;
        self.client.request(request).await.map_err(Error::from)
    }
}

#[derive(Clone)]
struct HttpsConnector {
    connector: HttpConnector,
    ssl_connector: SslConnector,
}

impl hyper::service::Service<Uri> for HttpsConnector {
    type Response = MaybeTlsStream;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.connector.poll_ready(ctx).map_err(Error::from)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let mut connector = self.connector.clone();
        let ssl_connector = self.ssl_connector.clone();
        let is_https = dst.scheme() == Some(&http::uri::Scheme::HTTPS);
        let host = match dst.host() {
            Some(host) => host.to_owned(),
            None => return futures::future::err(format_err!("URL has no host")).boxed(),
        };

        async move {
            let dst_str = dst.to_string();
            let tcp = connector
                .call(dst)
                .await
                .map_err(|err| format_err!("connecting to {}: {}", dst_str, err))?;
            if is_https {
                let config = ssl_connector.configure()?;
                let mut stream = SslStream::new(config.into_ssl(&host)?, tcp)?;
                Pin::new(&mut stream).connect().await?;
                Ok(MaybeTlsStream::Secured(Box::new(stream)))
            } else {
                Ok(MaybeTlsStream::Plain(tcp))
            }
        }
        .boxed()
    }
}

enum MaybeTlsStream {
    Plain(TcpStream),
    Secured(Box<SslStream<TcpStream>>),
}

impl Connection for MaybeTlsStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Secured(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Secured(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Secured(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Secured(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
