//! Image resolution for the containerd backend.
//!
//! Pull goes through the transfer service (registry source, image-store
//! destination with an unpack configuration for the chosen snapshotter).
//! The snapshot parent and the process defaults come from the image config,
//! which is read back out of the content store.

use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{
    GetImageRequest, ReadContentRequest, TransferOptions, TransferRequest,
};
use containerd_client::types::transfer::{ImageStore, OciRegistry, UnpackConfiguration};
use containerd_client::types::Platform;
use containerd_client::with_namespace;
use prost::Message;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{debug, info};

use gantry_core::{Error, PullPolicy, Result};

/// Process defaults baked into an image.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    // Registries emit explicit nulls for unset lists, hence Option<Vec<_>>.
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
    #[serde(rename = "User", default)]
    pub user: Option<String>,
}

/// What the backend needs to know about a resolved image.
#[derive(Debug, Clone, Default)]
pub struct ImageMeta {
    pub config: ImageConfig,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    digest: String,
    #[serde(default)]
    platform: Option<DescriptorPlatform>,
}

#[derive(Debug, Deserialize)]
struct DescriptorPlatform {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    config: Descriptor,
}

#[derive(Debug, Deserialize)]
struct Index {
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: ImageConfig,
    rootfs: RootFs,
}

#[derive(Debug, Deserialize)]
struct RootFs {
    diff_ids: Vec<String>,
}

fn is_index(media_type: &str) -> bool {
    media_type == "application/vnd.oci.image.index.v1+json"
        || media_type == "application/vnd.docker.distribution.manifest.list.v2+json"
}

/// The runtime architecture in OCI platform terms.
fn oci_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn to_any<T: Message>(type_url: &str, message: &T) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

/// Layer chain identity: the snapshot name the unpacker gave the image's
/// topmost layer. `chain(n) = sha256(chain(n-1) + " " + diff(n))`.
pub fn chain_id(diff_ids: &[String]) -> Option<String> {
    let mut ids = diff_ids.iter();
    let mut chain = ids.next()?.clone();
    for diff in ids {
        let digest = Sha256::digest(format!("{chain} {diff}").as_bytes());
        chain = format!("sha256:{}", hex::encode(digest));
    }
    Some(chain)
}

pub struct ImageService {
    channel: Channel,
    namespace: String,
}

impl ImageService {
    pub fn new(channel: Channel, namespace: impl Into<String>) -> Self {
        Self {
            channel,
            namespace: namespace.into(),
        }
    }

    async fn exists(&self, image: &str) -> Result<bool> {
        let mut images = ImagesClient::new(self.channel.clone());
        let request = GetImageRequest {
            name: image.to_string(),
        };
        match images.get(with_namespace!(request, self.namespace)).await {
            Ok(response) => Ok(response.into_inner().image.is_some()),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(false),
            Err(status) => Err(Error::Internal(status.to_string())),
        }
    }

    /// Fetch the image under the step's pull policy and unpack it into the
    /// snapshotter.
    pub async fn pull(
        &self,
        image: &str,
        policy: PullPolicy,
        snapshotter: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match policy {
            PullPolicy::IfMissing if self.exists(image).await? => {
                debug!(image, "image already present");
                return Ok(());
            }
            PullPolicy::Never => {
                return if self.exists(image).await? {
                    Ok(())
                } else {
                    Err(Error::ImageMissing(image.to_string()))
                };
            }
            _ => {}
        }

        info!(image, snapshotter, "pulling image");
        let platform = Platform {
            os: "linux".to_string(),
            architecture: oci_arch().to_string(),
            ..Default::default()
        };
        let source = OciRegistry {
            reference: image.to_string(),
            ..Default::default()
        };
        let destination = ImageStore {
            name: image.to_string(),
            platforms: vec![platform.clone()],
            unpacks: vec![UnpackConfiguration {
                platform: Some(platform),
                snapshotter: snapshotter.to_string(),
            }],
            ..Default::default()
        };

        let request = TransferRequest {
            source: Some(to_any(
                "types.containerd.io/containerd.types.transfer.OCIRegistry",
                &source,
            )),
            destination: Some(to_any(
                "types.containerd.io/containerd.types.transfer.ImageStore",
                &destination,
            )),
            options: Some(TransferOptions::default()),
        };

        let mut transfer = TransferClient::new(self.channel.clone());
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = transfer.transfer(with_namespace!(request, self.namespace)) => {
                outcome.map(|_| ()).map_err(|status| Error::ImagePull {
                    image: image.to_string(),
                    reason: status.message().to_string(),
                })
            }
        }
    }

    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let mut content = ContentClient::new(self.channel.clone());
        let request = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };
        let mut stream = content
            .read(with_namespace!(request, self.namespace))
            .await
            .map_err(|status| match status.code() {
                tonic::Code::NotFound => Error::NotFound(format!("content {digest}")),
                _ => Error::Internal(status.to_string()),
            })?
            .into_inner();

        let mut blob = Vec::new();
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(|status| Error::Internal(status.to_string()))?
        {
            blob.extend_from_slice(&chunk.data);
        }
        Ok(blob)
    }

    /// Walk target → (index →) manifest → config and parse out the process
    /// defaults and layer diff IDs.
    pub async fn resolve(&self, image: &str) -> Result<ImageMeta> {
        let mut images = ImagesClient::new(self.channel.clone());
        let request = GetImageRequest {
            name: image.to_string(),
        };
        let target = images
            .get(with_namespace!(request, self.namespace))
            .await
            .map_err(|status| match status.code() {
                tonic::Code::NotFound => Error::ImageMissing(image.to_string()),
                _ => Error::Internal(status.to_string()),
            })?
            .into_inner()
            .image
            .and_then(|i| i.target)
            .ok_or_else(|| Error::ImageMissing(image.to_string()))?;

        let manifest_digest = if is_index(&target.media_type) {
            let index: Index = serde_json::from_slice(&self.read_blob(&target.digest).await?)
                .map_err(|e| Error::Internal(format!("image index for {image}: {e}")))?;
            pick_manifest(&index, oci_arch())
                .ok_or_else(|| {
                    Error::ImagePull {
                        image: image.to_string(),
                        reason: format!("no manifest for linux/{}", oci_arch()),
                    }
                })?
                .digest
                .clone()
        } else {
            target.digest.clone()
        };

        let manifest: Manifest =
            serde_json::from_slice(&self.read_blob(&manifest_digest).await?)
                .map_err(|e| Error::Internal(format!("image manifest for {image}: {e}")))?;
        let config: ConfigBlob =
            serde_json::from_slice(&self.read_blob(&manifest.config.digest).await?)
                .map_err(|e| Error::Internal(format!("image config for {image}: {e}")))?;

        Ok(ImageMeta {
            config: config.config,
            diff_ids: config.rootfs.diff_ids,
        })
    }
}

fn pick_manifest<'a>(index: &'a Index, arch: &str) -> Option<&'a Descriptor> {
    index
        .manifests
        .iter()
        .find(|d| {
            d.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .or_else(|| index.manifests.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_of_single_layer_is_the_diff_id() {
        let diff = "sha256:0000000000000000000000000000000000000000000000000000000000000001";
        assert_eq!(chain_id(&[diff.to_string()]).unwrap(), diff);
        assert_eq!(chain_id(&[]), None);
    }

    #[test]
    fn chain_id_is_deterministic_and_order_sensitive() {
        let a = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let b = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        let forward = chain_id(&[a.to_string(), b.to_string()]).unwrap();
        let reverse = chain_id(&[b.to_string(), a.to_string()]).unwrap();

        assert_eq!(forward, chain_id(&[a.to_string(), b.to_string()]).unwrap());
        assert_ne!(forward, reverse);
        assert!(forward.starts_with("sha256:"));
        assert_eq!(forward.len(), "sha256:".len() + 64);
        assert_ne!(forward, a);
        assert_ne!(forward, b);
    }

    #[test]
    fn index_manifest_selection_prefers_platform_match() {
        let index: Index = serde_json::from_value(serde_json::json!({
            "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                 "digest": "sha256:arm",
                 "platform": {"architecture": "arm64", "os": "linux"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                 "digest": "sha256:amd",
                 "platform": {"architecture": "amd64", "os": "linux"}},
            ]
        }))
        .unwrap();

        assert_eq!(pick_manifest(&index, "amd64").unwrap().digest, "sha256:amd");
        assert_eq!(pick_manifest(&index, "arm64").unwrap().digest, "sha256:arm");
        // Unknown platform falls back to the first entry.
        assert_eq!(pick_manifest(&index, "s390x").unwrap().digest, "sha256:arm");
    }

    #[test]
    fn config_blob_parses_docker_style_keys() {
        let blob: ConfigBlob = serde_json::from_value(serde_json::json!({
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Cmd": ["sh"],
                "WorkingDir": "/app"
            },
            "rootfs": {"type": "layers", "diff_ids": ["sha256:x"]}
        }))
        .unwrap();
        assert_eq!(blob.config.env.as_deref(), Some(&["PATH=/usr/bin".to_string()][..]));
        assert_eq!(blob.config.cmd.as_deref(), Some(&["sh".to_string()][..]));
        assert_eq!(blob.config.working_dir.as_deref(), Some("/app"));
        assert_eq!(blob.rootfs.diff_ids, vec!["sha256:x"]);
    }

    #[test]
    fn media_type_classification() {
        assert!(is_index("application/vnd.oci.image.index.v1+json"));
        assert!(is_index(
            "application/vnd.docker.distribution.manifest.list.v2+json"
        ));
        assert!(!is_index("application/vnd.oci.image.manifest.v1+json"));
    }
}
