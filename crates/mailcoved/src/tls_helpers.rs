use anyhow::Context;
use rustls::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;

/// Build the rustls server config for STARTTLS. With no key
/// configured, a self-signed certificate for `hostname` is generated
/// on the fly; that is plenty for a capture server that only ever
/// talks to test harnesses.
pub fn make_server_config(
    hostname: &str,
    tls_private_key: &Option<PathBuf>,
    tls_certificate: &Option<PathBuf>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut certificates = vec![];
    let private_key = match tls_private_key {
        Some(key) => {
            let data = std::fs::read(key)
                .with_context(|| format!("reading private key from {}", key.display()))?;
            load_private_key(&data)
                .with_context(|| format!("loading private key from {}", key.display()))?
        }
        None => {
            let cert = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(rustls::Certificate(cert.serialize_der()?));
            rustls::PrivateKey(cert.serialize_private_key_der())
        }
    };

    if let Some(cert_file) = tls_certificate {
        let data = std::fs::read(cert_file)
            .with_context(|| format!("reading certificates from {}", cert_file.display()))?;
        certificates = load_certs(&data)
            .with_context(|| format!("loading certificates from {}", cert_file.display()))?;
    }

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}

fn load_certs(data: &[u8]) -> anyhow::Result<Vec<rustls::Certificate>> {
    let mut reader = std::io::BufReader::new(data);
    Ok(rustls_pemfile::certs(&mut reader)
        .context("reading PEM encoded certificates")?
        .iter()
        .map(|v| rustls::Certificate(v.clone()))
        .collect())
}

fn load_private_key(data: &[u8]) -> anyhow::Result<rustls::PrivateKey> {
    let mut reader = std::io::BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader).context("parsing private key PEM")? {
            Some(rustls_pemfile::Item::RSAKey(key)) => return Ok(rustls::PrivateKey(key)),
            Some(rustls_pemfile::Item::PKCS8Key(key)) => return Ok(rustls::PrivateKey(key)),
            Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
            None => break,
            _ => {}
        }
    }

    anyhow::bail!("no keys found in key data (encrypted keys not supported)");
}
