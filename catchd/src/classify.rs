//! Payload classification.
//!
//! Maps the opaque bytes of an uploaded payload to a payload kind. Native
//! binaries are additionally checked against the host target; a wrong-arch
//! binary is a hard error rather than `Unknown` so the installer can abort
//! with a useful message.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Binary,
    Script,
    Compose,
    TypeScript,
    Zstd,
    Unknown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("binary architecture {binary} does not match host architecture {host}")]
    ArchMismatch { binary: String, host: String },

    #[error("darwin binary (Mach-O) on non-darwin system")]
    ForeignMachO,

    #[error("non-darwin (ELF) binary on darwin system")]
    ForeignElf,
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

// Mach-O magics, both endiannesses plus the fat header.
const MACHO_MAGICS: [u32; 5] = [0xfeed_face, 0xfeed_facf, 0xcefa_edfe, 0xcffa_edfe, 0xcafe_babe];

/// Classify `payload` for a host described by `(os, arch)` using
/// `std::env::consts` names (`"linux"`, `"x86_64"`, ...).
///
/// Pure: equal inputs always produce equal outputs. Every failure mode other
/// than an architecture mismatch degrades to `Unknown`.
pub fn classify(payload: &[u8], os: &str, arch: &str) -> Result<PayloadKind, ClassifyError> {
    if payload.len() >= 4 {
        let magic = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if payload[..4] == ELF_MAGIC {
            if os == "macos" {
                return Err(ClassifyError::ForeignElf);
            }
            check_elf_arch(payload, arch)?;
            return Ok(PayloadKind::Binary);
        }
        if MACHO_MAGICS.contains(&magic) {
            if os != "macos" {
                return Err(ClassifyError::ForeignMachO);
            }
            check_macho_arch(payload, arch)?;
            return Ok(PayloadKind::Binary);
        }
        if payload[..4] == ZSTD_MAGIC {
            return Ok(PayloadKind::Zstd);
        }
    }
    if payload.starts_with(b"#!") {
        return Ok(PayloadKind::Script);
    }
    if is_compose(payload) {
        return Ok(PayloadKind::Compose);
    }
    if is_typescript(payload) {
        return Ok(PayloadKind::TypeScript);
    }
    Ok(PayloadKind::Unknown)
}

/// Verify the ELF machine field against the host architecture.
fn check_elf_arch(payload: &[u8], host_arch: &str) -> Result<(), ClassifyError> {
    // e_machine is a half-word at offset 18; EI_DATA at offset 5 gives its
    // byte order.
    if payload.len() < 20 {
        return Err(ClassifyError::ArchMismatch {
            binary: "truncated".to_string(),
            host: host_arch.to_string(),
        });
    }
    let machine = if payload[5] == 2 {
        u16::from_be_bytes([payload[18], payload[19]])
    } else {
        u16::from_le_bytes([payload[18], payload[19]])
    };
    let binary_arch = match machine {
        0x03 => "x86",
        0x28 => "arm",
        0x3e => "x86_64",
        0xb7 => "aarch64",
        0xf3 => "riscv64",
        other => {
            return Err(ClassifyError::ArchMismatch {
                binary: format!("unknown (e_machine {other:#x})"),
                host: host_arch.to_string(),
            })
        }
    };
    if binary_arch != host_arch {
        return Err(ClassifyError::ArchMismatch {
            binary: binary_arch.to_string(),
            host: host_arch.to_string(),
        });
    }
    Ok(())
}

/// Verify the Mach-O cputype field against the host architecture. Fat
/// binaries match when any of their slices do.
fn check_macho_arch(payload: &[u8], host_arch: &str) -> Result<(), ClassifyError> {
    let mismatch = |binary: String| ClassifyError::ArchMismatch {
        binary,
        host: host_arch.to_string(),
    };
    if payload.len() < 8 {
        return Err(mismatch("truncated".to_string()));
    }
    let magic = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let cputypes: Vec<u32> = match magic {
        // Thin image: cputype is the word after the magic, in the image's
        // own byte order.
        0xfeed_face | 0xfeed_facf => {
            vec![u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]])]
        }
        0xcefa_edfe | 0xcffa_edfe => {
            vec![u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]])]
        }
        // Fat image: a big-endian arch table, cputype first in each entry.
        0xcafe_babe => {
            let count =
                u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
            let mut types = Vec::new();
            for i in 0..count.min(16) {
                let off = 8 + i * 20;
                if payload.len() < off + 4 {
                    break;
                }
                types.push(u32::from_be_bytes([
                    payload[off],
                    payload[off + 1],
                    payload[off + 2],
                    payload[off + 3],
                ]));
            }
            types
        }
        _ => Vec::new(),
    };

    let arch_of = |cputype: u32| match cputype {
        0x0000_0007 => Some("x86"),
        0x0100_0007 => Some("x86_64"),
        0x0000_000c => Some("arm"),
        0x0100_000c => Some("aarch64"),
        _ => None,
    };
    if cputypes
        .iter()
        .any(|t| arch_of(*t) == Some(host_arch))
    {
        return Ok(());
    }
    let found = cputypes
        .iter()
        .filter_map(|t| arch_of(*t))
        .collect::<Vec<_>>()
        .join(",");
    let found = if found.is_empty() {
        "unknown".to_string()
    } else {
        found
    };
    Err(mismatch(found))
}

/// A compose payload is YAML with a top-level `services` mapping.
fn is_compose(payload: &[u8]) -> bool {
    #[derive(serde::Deserialize)]
    struct ComposeShape {
        services: Option<serde_yaml::Mapping>,
    }
    match serde_yaml::from_slice::<ComposeShape>(payload) {
        Ok(shape) => shape.services.is_some(),
        Err(_) => false,
    }
}

/// Syntactic sniff for TypeScript source: UTF-8 text leading with module or
/// type syntax.
fn is_typescript(payload: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(payload) else {
        return false;
    };
    text.lines()
        .map(str::trim_start)
        .filter(|l| !l.is_empty() && !l.starts_with("//"))
        .take(20)
        .any(|l| {
            l.starts_with("import ")
                || l.starts_with("export ")
                || l.starts_with("interface ")
                || l.starts_with("type ")
                || l.starts_with("const ")
                || l.starts_with("function ")
                || l.starts_with("async function ")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf(machine: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = 2; // ELFCLASS64
        bytes[5] = 1; // little endian
        bytes[18..20].copy_from_slice(&machine.to_le_bytes());
        bytes
    }

    #[test]
    fn matching_elf_is_a_binary() {
        let payload = elf(0x3e);
        assert_eq!(
            classify(&payload, "linux", "x86_64"),
            Ok(PayloadKind::Binary)
        );
    }

    #[test]
    fn classification_is_stable() {
        let payload = elf(0xb7);
        let first = classify(&payload, "linux", "aarch64");
        for _ in 0..3 {
            assert_eq!(classify(&payload, "linux", "aarch64"), first);
        }
    }

    #[test]
    fn wrong_arch_elf_is_a_hard_error() {
        let payload = elf(0xb7); // aarch64 binary
        assert_eq!(
            classify(&payload, "linux", "x86_64"),
            Err(ClassifyError::ArchMismatch {
                binary: "aarch64".to_string(),
                host: "x86_64".to_string(),
            })
        );
    }

    #[test]
    fn macho_on_linux_is_a_hard_error() {
        let mut payload = vec![0u8; 32];
        payload[..4].copy_from_slice(&0xfeed_facfu32.to_be_bytes());
        assert_eq!(
            classify(&payload, "linux", "x86_64"),
            Err(ClassifyError::ForeignMachO)
        );
    }

    fn macho64_le(cputype: u32) -> Vec<u8> {
        // 64-bit little-endian image: magic bytes CF FA ED FE on disk.
        let mut bytes = vec![0u8; 32];
        bytes[..4].copy_from_slice(&0xcffa_edfeu32.to_be_bytes());
        bytes[4..8].copy_from_slice(&cputype.to_le_bytes());
        bytes
    }

    #[test]
    fn matching_macho_is_a_binary() {
        let payload = macho64_le(0x0100_000c); // arm64
        assert_eq!(
            classify(&payload, "macos", "aarch64"),
            Ok(PayloadKind::Binary)
        );
    }

    #[test]
    fn wrong_arch_macho_is_a_hard_error() {
        let payload = macho64_le(0x0100_0007); // x86_64 image
        assert_eq!(
            classify(&payload, "macos", "aarch64"),
            Err(ClassifyError::ArchMismatch {
                binary: "x86_64".to_string(),
                host: "aarch64".to_string(),
            })
        );
    }

    #[test]
    fn fat_macho_matches_any_slice() {
        // Fat header: magic, nfat_arch=2, entries with cputype first.
        let mut payload = vec![0u8; 8 + 2 * 20];
        payload[..4].copy_from_slice(&0xcafe_babeu32.to_be_bytes());
        payload[4..8].copy_from_slice(&2u32.to_be_bytes());
        payload[8..12].copy_from_slice(&0x0100_0007u32.to_be_bytes()); // x86_64
        payload[28..32].copy_from_slice(&0x0100_000cu32.to_be_bytes()); // arm64
        assert_eq!(
            classify(&payload, "macos", "aarch64"),
            Ok(PayloadKind::Binary)
        );
        assert_eq!(
            classify(&payload, "macos", "x86_64"),
            Ok(PayloadKind::Binary)
        );
        assert!(matches!(
            classify(&payload, "macos", "arm"),
            Err(ClassifyError::ArchMismatch { .. })
        ));
    }

    #[test]
    fn zstd_frame_detected() {
        let mut payload = ZSTD_MAGIC.to_vec();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(classify(&payload, "linux", "x86_64"), Ok(PayloadKind::Zstd));
    }

    #[test]
    fn shebang_is_a_script() {
        assert_eq!(
            classify(b"#!/bin/sh\necho hi\n", "linux", "x86_64"),
            Ok(PayloadKind::Script)
        );
    }

    #[test]
    fn compose_requires_services_key() {
        let compose = b"services:\n  web:\n    image: nginx\n";
        assert_eq!(
            classify(compose, "linux", "x86_64"),
            Ok(PayloadKind::Compose)
        );
        let not_compose = b"volumes:\n  data: {}\n";
        assert_ne!(
            classify(not_compose, "linux", "x86_64"),
            Ok(PayloadKind::Compose)
        );
    }

    #[test]
    fn typescript_source_detected() {
        let ts = b"import { serve } from \"bun\";\nexport const x: number = 1;\n";
        assert_eq!(
            classify(ts, "linux", "x86_64"),
            Ok(PayloadKind::TypeScript)
        );
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(
            classify(&[0xde, 0xad, 0xbe, 0xef, 0x00], "linux", "x86_64"),
            Ok(PayloadKind::Unknown)
        );
    }
}
