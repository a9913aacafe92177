//! Extraction of gzip-compressed tar archives.

use flate2::read::GzDecoder;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::Archive;

/// A map of items extracted from an archive. Keys are top-level entries, mapped to the paths of
/// the files beneath them.
pub type TarItems = std::collections::BTreeMap<PathBuf, Vec<PathBuf>>;

fn decompress_archive(compressed: &[u8]) -> Result<Vec<u8>, io::Error> {
    let mut decoder = GzDecoder::new(compressed);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

fn read_archive_data<T>(data: T) -> Archive<io::Cursor<T>>
where
    io::Cursor<T>: Read,
{
    Archive::new(io::Cursor::new(data))
}

/// Split the first path component from the rest.
fn split_first_component(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let mut comps = path.components();
    let first = PathBuf::from(comps.next()?.as_os_str());
    Some((first, comps.collect::<PathBuf>()))
}

/// Extract a compressed tar archive held in memory into `out_dir`. Entries that would land
/// outside `out_dir` are skipped. Returns the extracted files grouped by top-level entry.
pub fn extract_tar_from_bytes(compressed: &[u8], out_dir: &Path) -> Result<TarItems, io::Error> {
    let mut extracted_files = TarItems::new();
    let archive = decompress_archive(compressed)?;
    std::fs::create_dir_all(out_dir)?;
    for archive_entry in read_archive_data(archive).entries()? {
        let mut archive_entry = archive_entry?;
        let path_in_archive = archive_entry.path()?.into_owned();
        let is_dir = archive_entry.header().entry_type().is_dir();
        if !archive_entry.unpack_in(out_dir)? {
            tracing::warn!(path = %path_in_archive.display(), "skipping archive entry outside the output directory");
            continue;
        }
        if is_dir {
            continue;
        }
        if let Some((first, rest)) = split_first_component(&path_in_archive) {
            extracted_files.entry(first).or_default().push(rest);
        }
    }
    Ok(extracted_files)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    /// Build a `.tar.gz` in memory from `(path, contents, mode)` triples.
    pub(crate) fn tarball(files: &[(&str, &str, u32)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents, mode) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn extracts_files_grouped_by_top_level_directory() {
        let archive = tarball(&[
            ("tool-1.0/bin/tool", "#!/bin/sh\n", 0o755),
            ("tool-1.0/README", "docs", 0o644),
            ("NOTICE", "legal", 0o644),
        ]);
        let out = tempfile::tempdir().unwrap();
        let items = extract_tar_from_bytes(&archive, out.path()).unwrap();
        assert_eq!(
            items.get(Path::new("tool-1.0")).unwrap(),
            &vec![PathBuf::from("bin/tool"), PathBuf::from("README")]
        );
        assert!(items.contains_key(Path::new("NOTICE")));
        assert_eq!(
            std::fs::read_to_string(out.path().join("tool-1.0/README")).unwrap(),
            "docs"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(out.path().join("tool-1.0/bin/tool"))
                .unwrap()
                .permissions()
                .mode();
            assert_ne!(mode & 0o111, 0);
        }
    }

    #[test]
    fn corrupt_archive_is_an_error() {
        let out = tempfile::tempdir().unwrap();
        assert!(extract_tar_from_bytes(b"definitely not gzip", out.path()).is_err());
    }
}
