use crate::error::{Error, ProtocolError};
use crate::protocol::{AuthMethod, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// negotiate_auth handles the method selection handshake with the client
///
/// "No authentication required" is selected whatever the client offered,
/// even when method 0x00 is missing from its list.
pub async fn negotiate_auth<S>(stream: &mut S) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    // Instantiate handshake buffer & read
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    // Parse version and client methods from handshake
    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(ProtocolError::Version(version).into());
    }

    // Read offered methods: exactly NMETHODS bytes
    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    // DEBUG
    debug!("offered auth methods: {:?}", methods);

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream
        .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAuth as u8])
        .await?;
    stream.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn selects_no_auth() {
        let mut stream = Builder::new()
            .read(&[5, 1])
            .read(&[0])
            .write(&[5, 0])
            .build();

        negotiate_auth(&mut stream).await.unwrap();
    }

    #[tokio::test]
    async fn selects_no_auth_even_when_not_offered() {
        let mut stream = Builder::new()
            .read(&[5, 2, 0x01, 0x02])
            .write(&[5, 0])
            .build();

        negotiate_auth(&mut stream).await.unwrap();
    }

    #[tokio::test]
    async fn accepts_empty_method_list() {
        let mut stream = Builder::new().read(&[5, 0]).write(&[5, 0]).build();

        negotiate_auth(&mut stream).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_other_versions_without_reply() {
        for version in [0u8, 4, 6, 0xff] {
            let mut stream = Builder::new().read(&[version, 1]).build();

            let err = negotiate_auth(&mut stream).await.unwrap_err();

            assert!(
                matches!(err, Error::Protocol(ProtocolError::Version(v)) if v == version),
                "version {version}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn short_method_list_fails() {
        let mut stream = Builder::new().read(&[5, 3, 0]).build();

        let err = negotiate_auth(&mut stream).await.unwrap_err();

        assert!(matches!(err, Error::Protocol(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn short_hello_fails() {
        let mut stream = Builder::new().read(&[5]).build();

        assert!(negotiate_auth(&mut stream).await.is_err());
    }
}
