//! Snapshot Versioner (spec §4.6). A pure function of two file payloads,
//! grounded in the general sha256-id-for-artifact idiom used by
//! `features/images::repo` (content-addressed image digests).

use sha2::{Digest, Sha256};

/// `sha256(sha256(kernel) || sha256(baseRootfs))[0..32 hex chars]`.
pub fn template_snapshot_id(kernel_bytes: &[u8], base_rootfs_bytes: &[u8]) -> String {
    let kernel_digest = Sha256::digest(kernel_bytes);
    let rootfs_digest = Sha256::digest(base_rootfs_bytes);

    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(&kernel_digest);
    combined.extend_from_slice(&rootfs_digest);

    let outer = Sha256::digest(&combined);
    hex::encode(outer)[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_pure_for_identical_inputs() {
        let a = template_snapshot_id(b"kernel-bytes", b"rootfs-bytes");
        let b = template_snapshot_id(b"kernel-bytes", b"rootfs-bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn differs_when_either_input_changes() {
        let base = template_snapshot_id(b"kernel-bytes", b"rootfs-bytes");
        let diff_kernel = template_snapshot_id(b"other-kernel", b"rootfs-bytes");
        let diff_rootfs = template_snapshot_id(b"kernel-bytes", b"other-rootfs");
        assert_ne!(base, diff_kernel);
        assert_ne!(base, diff_rootfs);
        assert_ne!(diff_kernel, diff_rootfs);
    }

    #[test]
    fn is_order_sensitive_between_kernel_and_rootfs() {
        let a = template_snapshot_id(b"left", b"right");
        let b = template_snapshot_id(b"right", b"left");
        assert_ne!(a, b);
    }
}
