use k8s_openapi::api::core::v1::{Volume, VolumeMount};

/// A bucket-backed volume and the container mount that goes with it
#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactMount {
    /// Pod volume
    pub volume: Volume,
    /// Container mount of `volume`
    pub mount: VolumeMount,
}

impl ArtifactMount {
    /// Split into parts for assembling a pod spec
    pub fn into_parts(self) -> (Volume, VolumeMount) {
        (self.volume, self.mount)
    }
}

/// Collect mounts into the pod volumes and container mounts lists
pub fn split_mounts(mounts: Vec<ArtifactMount>) -> (Vec<Volume>, Vec<VolumeMount>) {
    mounts.into_iter().map(ArtifactMount::into_parts).unzip()
}
