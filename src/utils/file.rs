use std::path::{Path, PathBuf};
use crate::config::defs::{PipelineError, HISAT2_INDEX_EXT};


/// Builds `<dir>/[prefix<delim>]<base>[<delim>suffix]`.
///
/// # Arguments
///
/// * `base` - Base name, usually the sample name.
/// * `dir` - Optional directory to place the file in.
/// * `prefix` - Optional leading tag.
/// * `suffix` - Optional trailing tag, may carry the extension (e.g. "sorted.bam").
/// * `delimiter` - Joins prefix, base and suffix.
///
/// # Returns
/// PathBuf
pub fn file_path_manipulator(
    base: &Path,
    dir: Option<&Path>,
    prefix: Option<&str>,
    suffix: Option<&str>,
    delimiter: &str,
) -> PathBuf {
    let base = base.to_string_lossy();
    let mut name = String::new();
    if let Some(prefix) = prefix {
        name.push_str(prefix);
        name.push_str(delimiter);
    }
    name.push_str(&base);
    if let Some(suffix) = suffix {
        name.push_str(delimiter);
        name.push_str(suffix);
    }
    match dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}


/// Fails on the first path that is not an existing file.
pub fn validate_file_inputs<'a, I>(paths: I) -> Result<(), PipelineError>
where
    I: IntoIterator<Item = &'a Path>,
{
    for path in paths {
        if !path.is_file() {
            return Err(PipelineError::MissingInput(path.to_path_buf()));
        }
    }
    Ok(())
}


/// True when hisat2-build output for `prefix` is already on disk.
pub fn index_files_exist(prefix: &Path) -> bool {
    let first = format!("{}.1.{}", prefix.to_string_lossy(), HISAT2_INDEX_EXT);
    Path::new(&first).is_file()
}


/// Reads the chromosome/length table: two CSV columns, name and length. A
/// first row whose length is not numeric is taken as a header.
pub fn read_chrom_lengths(path: &Path) -> Result<Vec<(String, u64)>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| PipelineError::IOError(format!("{}: {}", path.display(), e)))?;

    let mut lengths = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| PipelineError::IOError(format!("{}: {}", path.display(), e)))?;
        if record.len() < 2 {
            return Err(PipelineError::InvalidManifest(format!(
                "{} line {}: expected name,length",
                path.display(),
                i + 1
            )));
        }
        match record[1].trim().parse::<u64>() {
            Ok(length) => lengths.push((record[0].to_string(), length)),
            Err(_) if i == 0 => continue,
            Err(e) => {
                return Err(PipelineError::InvalidManifest(format!(
                    "{} line {}: bad length '{}': {}",
                    path.display(),
                    i + 1,
                    &record[1],
                    e
                )));
            }
        }
    }
    Ok(lengths)
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_file_path_manipulator() {
        let out = Path::new("/runs/1");
        assert_eq!(
            file_path_manipulator(Path::new("s1"), Some(out), None, Some("sorted.bam"), "_"),
            PathBuf::from("/runs/1/s1_sorted.bam")
        );
        assert_eq!(
            file_path_manipulator(Path::new("s1.sam"), None, Some("tmp"), None, "-"),
            PathBuf::from("tmp-s1.sam")
        );
    }

    #[test]
    fn test_read_chrom_lengths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chr_length.csv");
        std::fs::write(&path, "chr,length\nchr1,1000\nchr2,500\n")?;
        let lengths = read_chrom_lengths(&path)?;
        assert_eq!(lengths, vec![("chr1".to_string(), 1000), ("chr2".to_string(), 500)]);

        std::fs::write(&path, "chr1,1000\nchr2,abc\n")?;
        assert!(read_chrom_lengths(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_validate_and_index_presence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let present = dir.path().join("genome.fna");
        std::fs::write(&present, ">chr1\nACGT\n")?;
        let missing = dir.path().join("genes.gtf");
        assert!(validate_file_inputs([present.as_path()]).is_ok());
        assert!(matches!(
            validate_file_inputs([present.as_path(), missing.as_path()]),
            Err(PipelineError::MissingInput(p)) if p == missing
        ));

        let prefix = dir.path().join("index_prefix");
        assert!(!index_files_exist(&prefix));
        std::fs::write(dir.path().join("index_prefix.1.ht2"), b"")?;
        assert!(index_files_exist(&prefix));
        Ok(())
    }
}
