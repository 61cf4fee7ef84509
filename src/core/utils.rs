use std::io::{Read, Seek};
use std::path::Path;
use zip::ZipArchive;

pub fn extract_zip<R: Read + Seek>(data: R, dest: &Path) -> anyhow::Result<usize> {
    let mut archive = ZipArchive::new(data)?;
    let mut written = 0;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;

        // ZIP Slip: only extract paths that stay inside dest
        let file_path = match file.enclosed_name() {
            Some(path) => path.to_owned(),
            None => continue,
        };

        let outpath = dest.join(&file_path);

        if file.name().ends_with('/') {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = std::fs::File::create(&outpath)?;
            std::io::copy(&mut file, &mut outfile)?;
            written += 1;
        }
    }

    Ok(written)
}

/// Read every regular entry of an archive into memory, in archive order.
/// Fails once the uncompressed entries add up to more than `limit` bytes.
pub fn read_zip_entries<R: Read + Seek>(data: R, limit: u64) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut archive = ZipArchive::new(data)?;
    let mut entries = Vec::with_capacity(archive.len());
    let mut remaining = limit;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let name = file
            .name()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        // Header sizes are not trusted, only what actually decompresses
        let mut buf = Vec::with_capacity(file.size().min(remaining) as usize);
        let read = (&mut file).take(remaining + 1).read_to_end(&mut buf)? as u64;
        if read > remaining {
            anyhow::bail!("archive expands to more than {} bytes", limit);
        }
        remaining -= read;
        entries.push((name, buf));
    }

    Ok(entries)
}
