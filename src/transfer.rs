use crate::{
    Result, log_info, log_warn,
    session::{RemoteSession, run_checked, run_checked_with_progress},
};
use std::io::{self, Write};

/// A transient archive holding exactly one image file, named after the
/// VM's short name. At most one archive exists per host at any time.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveHandle {
    pub name: String,
    pub directory: String,
}

impl ArchiveHandle {
    pub fn new(vm_short_name: &str, directory: &str) -> Self {
        Self {
            name: format!("{}.tgz", vm_short_name),
            directory: directory.to_string(),
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.directory, self.name)
    }
}

/// Pack a single image file into an archive on the host. Sparse regions
/// survive the round trip, which matters for raw images.
pub async fn archive(
    session: &mut dyn RemoteSession,
    handle: &ArchiveHandle,
    image_file: &str,
) -> Result<()> {
    log_info!("archiving {} into {}", image_file, handle.name);
    run_checked(
        session,
        &format!(
            "cd {}; bsdtar -cf {} {}",
            handle.directory, handle.name, image_file
        ),
    )
    .await?;
    Ok(())
}

/// Ship the archive host-to-host with rsync, streaming progress lines to
/// the operator. Compression trades CPU for bandwidth and is optional.
pub async fn transfer(
    session: &mut dyn RemoteSession,
    handle: &ArchiveHandle,
    destination_ip: &str,
    transfer_key: &str,
    compress: bool,
) -> Result<()> {
    let flags = if compress { "-avz" } else { "-v" };
    let archive_path = handle.path();
    let command = format!(
        "rsync {} -e 'ssh -i {}' --progress {} root@{}:{}",
        flags, transfer_key, archive_path, destination_ip, archive_path
    );
    log_info!("transferring {} to {}", handle.name, destination_ip);
    run_checked_with_progress(session, &command, &mut |chunk| {
        print!("\r{}", chunk.trim_end());
        let _ = io::stdout().flush();
    })
    .await?;
    println!();
    Ok(())
}

/// Unpack the archive on the destination host; the image file reappears
/// under its original name in the image directory.
pub async fn extract(session: &mut dyn RemoteSession, handle: &ArchiveHandle) -> Result<()> {
    log_info!("extracting {} on {}", handle.name, session.host());
    run_checked(
        session,
        &format!("cd {}; tar -xSf {}", handle.directory, handle.name),
    )
    .await?;
    Ok(())
}

/// Best-effort removal of a transient file. The data already landed, so a
/// failure here is only worth a warning.
pub async fn remove_file(session: &mut dyn RemoteSession, directory: &str, file: &str) {
    let command = format!("cd {}; rm -f {}", directory, file);
    match run_checked(session, &command).await {
        Ok(_) => log_info!("removed {} on {}", file, session.host()),
        Err(e) => log_warn!("failed to remove {} on {}: {}", file, session.host(), e),
    }
}

/// Best-effort archive cleanup.
pub async fn cleanup(session: &mut dyn RemoteSession, handle: &ArchiveHandle) {
    remove_file(session, &handle.directory, &handle.name).await;
}
