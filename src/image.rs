use crate::{
    CirrusError, Result, log_debug, log_info,
    session::{RemoteSession, run_checked},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Closed set of disk image formats the workflow understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskFormat {
    /// Flat image, all blocks stored directly.
    Raw,
    /// Layered copy-on-write image, possibly referencing a backing file.
    Qcow2,
}

impl DiskFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(DiskFormat::Raw),
            "qcow2" => Some(DiskFormat::Qcow2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A VM's primary disk as found on a compute host.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArtifact {
    pub path: String,
    pub format: DiskFormat,
    pub backing_file: Option<String>,
}

impl ImageArtifact {
    pub fn file_name(&self) -> &str {
        file_name_of(&self.path)
    }
}

pub fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Default image format per hypervisor-agent version. The table is policy
/// data from configuration; an agent version without an entry is a hard
/// precondition failure, never a silent default.
pub fn expected_format(formats: &HashMap<String, String>, agent_version: &str) -> Result<DiskFormat> {
    let name = formats.get(agent_version).ok_or_else(|| {
        CirrusError::Precondition(format!(
            "no image format mapping for agent version '{}'",
            agent_version
        ))
    })?;
    DiskFormat::from_name(name).ok_or_else(|| {
        CirrusError::ConfigError(format!(
            "format table maps '{}' to unsupported format '{}'",
            agent_version, name
        ))
    })
}

/// Resolve the primary disk path for a hypervisor instance by inspecting
/// its machine description. Exactly one non-removable disk device must be
/// attached; more than one usually means a secondary data volume, which
/// this workflow refuses to handle.
pub async fn resolve_primary_disk(
    session: &mut dyn RemoteSession,
    instance_name: &str,
) -> Result<String> {
    let output = run_checked(session, &format!("virsh dumpxml {}", instance_name)).await?;
    let mut disks = primary_disk_sources(&output.stdout);
    log_debug!("instance {} exposes {} disk device(s)", instance_name, disks.len());
    match disks.len() {
        1 => disks.pop().ok_or_else(|| {
            CirrusError::Precondition(format!(
                "no disk device found for instance '{}'",
                instance_name
            ))
        }),
        0 => Err(CirrusError::Precondition(format!(
            "no disk device found for instance '{}'",
            instance_name
        ))),
        n => Err(CirrusError::ManualIntervention(format!(
            "instance '{}' has {} disk devices, probably an attached volume; \
             migrate this node by hand",
            instance_name, n
        ))),
    }
}

/// Pull `<disk device='disk'>` source files out of a libvirt domain XML
/// dump. Removable media (`device='cdrom'`) is ignored.
fn primary_disk_sources(xml: &str) -> Vec<String> {
    let mut sources = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<disk") {
        let block = &rest[start..];
        let end = match block.find("</disk>") {
            Some(end) => end + "</disk>".len(),
            None => break,
        };
        let disk_block = &block[..end];
        let open_tag_end = disk_block.find('>').unwrap_or(disk_block.len());
        let open_tag = &disk_block[..open_tag_end];
        if extract_attribute(open_tag, "device").as_deref() == Some("disk") {
            if let Some(source_start) = disk_block.find("<source") {
                let source_tag = &disk_block[source_start..];
                let source_tag = &source_tag[..source_tag.find('>').unwrap_or(source_tag.len())];
                if let Some(file) = extract_attribute(source_tag, "file") {
                    sources.push(file);
                }
            }
        }
        rest = &rest[start + end..];
    }
    sources
}

/// Extract an XML attribute value, accepting both quote styles (virsh
/// emits single quotes).
fn extract_attribute(tag: &str, attr_name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("{}={}", attr_name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + end].to_string());
            }
        }
    }
    None
}

/// Classify an image file by its on-disk metadata.
pub async fn detect_format(session: &mut dyn RemoteSession, path: &str) -> Result<DiskFormat> {
    let output = run_checked(session, &format!("qemu-img info {}", path)).await?;
    let name = parse_file_format(&output.stdout).ok_or_else(|| {
        CirrusError::Precondition(format!("cannot determine image format of {}", path))
    })?;
    DiskFormat::from_name(&name).ok_or_else(|| {
        CirrusError::Precondition(format!("unsupported image format '{}' for {}", name, path))
    })
}

fn parse_file_format(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.strip_prefix("file format:"))
        .map(|value| value.trim().to_string())
}

/// Backing-file reference of a layered image, reduced to its file name.
pub async fn backing_file(session: &mut dyn RemoteSession, path: &str) -> Result<Option<String>> {
    let output = run_checked(session, &format!("qemu-img info {}", path)).await?;
    Ok(parse_backing_file(&output.stdout))
}

fn parse_backing_file(info: &str) -> Option<String> {
    let value = info
        .lines()
        .find_map(|line| line.strip_prefix("backing file:"))?
        .trim();
    // "backing file: /path/base.qcow2 (actual path: ...)" or bare path
    let path = match value.find(" (") {
        Some(paren) => &value[..paren],
        None => value,
    };
    Some(file_name_of(path.trim()).to_string())
}

/// Inspect an image file and build the full artifact record.
pub async fn inspect(session: &mut dyn RemoteSession, path: &str) -> Result<ImageArtifact> {
    let format = detect_format(session, path).await?;
    let backing = match format {
        DiskFormat::Qcow2 => backing_file(session, path).await?,
        DiskFormat::Raw => None,
    };
    Ok(ImageArtifact {
        path: path.to_string(),
        format,
        backing_file: backing,
    })
}

/// Convert an image in place: move (or copy, when the original must stay
/// usable for an in-place restart) the file aside to `<path>.ori`, then
/// write the converted image back at the original path.
pub async fn convert(
    session: &mut dyn RemoteSession,
    directory: &str,
    artifact: &ImageArtifact,
    target: DiskFormat,
    preserve_original: bool,
) -> Result<ImageArtifact> {
    let op = if preserve_original { "cp" } else { "mv" };
    log_info!(
        "converting {} from {} to {}",
        artifact.path,
        artifact.format,
        target
    );
    run_checked(
        session,
        &format!(
            "cd {}; {} {} {}.ori",
            directory, op, artifact.path, artifact.path
        ),
    )
    .await?;
    run_checked(
        session,
        &format!(
            "cd {}; qemu-img convert -f {} -O {} {}.ori {}",
            directory, artifact.format, target, artifact.path, artifact.path
        ),
    )
    .await?;
    Ok(ImageArtifact {
        path: artifact.path.clone(),
        format: target,
        backing_file: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_DISK_XML: &str = r#"
<domain type='kvm'>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/i-2-101-VM.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <target dev='hdc' bus='ide'/>
    </disk>
  </devices>
</domain>
"#;

    const MULTI_DISK_XML: &str = r#"
<domain type='kvm'>
  <devices>
    <disk type='file' device='disk'>
      <source file='/var/lib/libvirt/images/root.qcow2'/>
    </disk>
    <disk type='file' device='disk'>
      <source file='/var/lib/libvirt/images/data.qcow2'/>
    </disk>
  </devices>
</domain>
"#;

    #[test]
    fn finds_single_primary_disk_ignoring_cdrom() {
        let disks = primary_disk_sources(SINGLE_DISK_XML);
        assert_eq!(disks, vec!["/var/lib/libvirt/images/i-2-101-VM.qcow2"]);
    }

    #[test]
    fn counts_every_primary_disk() {
        let disks = primary_disk_sources(MULTI_DISK_XML);
        assert_eq!(disks.len(), 2);
    }

    #[test]
    fn attribute_extraction_accepts_both_quote_styles() {
        assert_eq!(
            extract_attribute("<disk type='file' device='disk'>", "device").as_deref(),
            Some("disk")
        );
        assert_eq!(
            extract_attribute(r#"<disk device="cdrom">"#, "device").as_deref(),
            Some("cdrom")
        );
        assert_eq!(extract_attribute("<disk>", "device"), None);
    }

    #[test]
    fn parses_qemu_img_format_line() {
        let info = "image: /var/lib/libvirt/images/root.qcow2\nfile format: qcow2\nvirtual size: 20G (21474836480 bytes)\n";
        assert_eq!(parse_file_format(info).as_deref(), Some("qcow2"));
        assert_eq!(parse_file_format("no format here"), None);
    }

    #[test]
    fn parses_backing_file_with_and_without_actual_path() {
        let with_paren = "file format: qcow2\nbacking file: /var/lib/libvirt/images/base.qcow2 (actual path: /var/lib/libvirt/images/base.qcow2)\n";
        assert_eq!(parse_backing_file(with_paren).as_deref(), Some("base.qcow2"));

        let bare = "file format: qcow2\nbacking file: /var/lib/libvirt/images/base.qcow2\n";
        assert_eq!(parse_backing_file(bare).as_deref(), Some("base.qcow2"));

        assert_eq!(parse_backing_file("file format: raw\n"), None);
    }

    #[test]
    fn format_table_lookup_is_strict() {
        let table = HashMap::from([
            ("4.4.2".to_string(), "raw".to_string()),
            ("4.9.3.0".to_string(), "qcow2".to_string()),
        ]);
        assert_eq!(expected_format(&table, "4.4.2").unwrap(), DiskFormat::Raw);
        assert_eq!(
            expected_format(&table, "4.9.3.0").unwrap(),
            DiskFormat::Qcow2
        );
        assert!(matches!(
            expected_format(&table, "4.11.0"),
            Err(CirrusError::Precondition(_))
        ));
    }

    #[test]
    fn file_name_strips_directories() {
        assert_eq!(file_name_of("/var/lib/libvirt/images/root.qcow2"), "root.qcow2");
        assert_eq!(file_name_of("root.qcow2"), "root.qcow2");
    }
}
