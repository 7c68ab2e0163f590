//! Building a kube client from the transport settings.
//!
//! Precedence: an explicit kubeconfig + context, then an explicit API
//! endpoint (optionally with client TLS files), then the inferred
//! configuration (local kubeconfig or in-cluster service account).

use std::path::PathBuf;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

const INLINE_NAME: &str = "kindex";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeconfigRef {
    pub path: PathBuf,
    pub context: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSettings {
    pub endpoint: Option<String>,
    pub tls: Option<TlsFiles>,
    pub kubeconfig: Option<KubeconfigRef>,
}

/// Kubeconfig describing a single endpoint with optional client certificates.
fn endpoint_kubeconfig(endpoint: &str, tls: Option<&TlsFiles>) -> Result<Kubeconfig> {
    let mut cluster = serde_json::json!({ "server": endpoint });
    let mut user = serde_json::json!({});
    if let Some(tls) = tls {
        cluster["certificate-authority"] = tls.ca.display().to_string().into();
        user["client-certificate"] = tls.cert.display().to_string().into();
        user["client-key"] = tls.key.display().to_string().into();
    }
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": INLINE_NAME, "cluster": cluster }],
        "users": [{ "name": INLINE_NAME, "user": user }],
        "contexts": [{ "name": INLINE_NAME, "context": { "cluster": INLINE_NAME, "user": INLINE_NAME } }],
        "current-context": INLINE_NAME,
    });
    serde_json::from_value(doc).context("building kubeconfig for endpoint")
}

pub async fn connect(settings: &ClientSettings) -> Result<Client> {
    let config = if let Some(kc) = &settings.kubeconfig {
        info!(path = %kc.path.display(), context = %kc.context, "using kubeconfig");
        let kubeconfig = Kubeconfig::read_from(&kc.path)
            .with_context(|| format!("reading kubeconfig {}", kc.path.display()))?;
        let opts = KubeConfigOptions { context: Some(kc.context.clone()), ..Default::default() };
        Config::from_custom_kubeconfig(kubeconfig, &opts).await.context("loading kubeconfig context")?
    } else if let Some(endpoint) = &settings.endpoint {
        info!(endpoint = %endpoint, tls = settings.tls.is_some(), "using explicit API endpoint");
        let kubeconfig = endpoint_kubeconfig(endpoint, settings.tls.as_ref())?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("configuring API endpoint")?
    } else {
        info!("inferring client configuration");
        Config::infer().await.context("inferring kube config")?
    };
    Client::try_from(config).context("creating kube client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_kubeconfig_selects_inline_context() {
        let tls = TlsFiles { cert: "/tls/cert.pem".into(), key: "/tls/key.pem".into(), ca: "/tls/ca.pem".into() };
        let kc = endpoint_kubeconfig("https://10.0.0.1:6443", Some(&tls)).expect("valid kubeconfig");
        assert_eq!(kc.current_context.as_deref(), Some(INLINE_NAME));
        assert_eq!(kc.clusters.len(), 1);
        assert_eq!(kc.auth_infos.len(), 1);
        assert_eq!(kc.contexts.len(), 1);
    }

    #[test]
    fn endpoint_kubeconfig_without_tls() {
        let kc = endpoint_kubeconfig("http://127.0.0.1:8080", None).expect("valid kubeconfig");
        assert_eq!(kc.clusters[0].name, INLINE_NAME);
    }
}
