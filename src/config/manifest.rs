//! Run manifests: the JSON wire types exchanged between the submitting
//! client and the API server, and the validated in-process manifest the
//! pipeline runs from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::config::defs::{PipelineError, DEFAULT_DESIGN_FORMULA, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SequencingMode {
    SingleEnd,
    PairedEnd,
}

impl TryFrom<u8> for SequencingMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SequencingMode::SingleEnd),
            2 => Ok(SequencingMode::PairedEnd),
            other => Err(format!("sequencing_type must be 1 (single-end) or 2 (paired-end), got {}", other)),
        }
    }
}

impl From<SequencingMode> for u8 {
    fn from(mode: SequencingMode) -> u8 {
        match mode {
            SequencingMode::SingleEnd => 1,
            SequencingMode::PairedEnd => 2,
        }
    }
}

/// One `fastq_list` entry: a bare file name, or an `[R1, R2]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FastqEntry {
    Single(String),
    Paired(String, String),
}

/// Body of `POST /rna_seq_analysis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub sample_name_list: Vec<String>,
    pub grouping_list: Vec<String>,
    pub chr_and_length: String,
    pub gtf: String,
    pub reference_genome: String,
    pub sequencing_type: SequencingMode,
    pub fastq_list: Vec<FastqEntry>,
    pub index_prefix: String,
    pub cpu_num: usize,
    pub target_path: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub sender_email: Option<String>,
    #[serde(default)]
    pub sender_password: Option<String>,
    #[serde(default)]
    pub phenotype: Option<String>,
    #[serde(default)]
    pub design_formula: Option<String>,
}

impl RunRequest {
    /// Remote working directory for this run: `<target_path>/<file_name>`.
    pub fn run_dir(&self) -> String {
        format!("{}/{}", self.target_path.trim_end_matches('/'), self.file_name)
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

/// Settings file read by the submitting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(flatten)]
    pub request: RunRequest,
    pub ssh_server_ip: String,
    pub ssh_port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<String>,
    pub source_file_list: Vec<String>,
    pub api_serve_ip: String,
    pub api_port: u16,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadSet {
    Single(PathBuf),
    Paired(PathBuf, PathBuf),
}

impl ReadSet {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            ReadSet::Single(p) => vec![p.as_path()],
            ReadSet::Paired(r1, r2) => vec![r1.as_path(), r2.as_path()],
        }
    }
}

/// Derived per-sample artifacts. Each slot is written once, when the
/// producing stage finalizes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleArtifacts {
    pub cleaned: Option<ReadSet>,
    pub alignment: Option<PathBuf>,
    pub sorted: Option<PathBuf>,
    pub counts: Option<PathBuf>,
}

fn finalize<T>(slot: &mut Option<T>, value: T, sample: &str, what: &str) -> Result<(), PipelineError> {
    if slot.is_some() {
        return Err(PipelineError::InvalidManifest(format!(
            "{} for sample {} was already finalized",
            what, sample
        )));
    }
    *slot = Some(value);
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub group: String,
    pub reads: ReadSet,
    pub artifacts: SampleArtifacts,
}

impl Sample {
    pub fn set_cleaned(&mut self, reads: ReadSet) -> Result<(), PipelineError> {
        finalize(&mut self.artifacts.cleaned, reads, &self.name, "cleaned reads")
    }

    pub fn set_alignment(&mut self, path: PathBuf) -> Result<(), PipelineError> {
        finalize(&mut self.artifacts.alignment, path, &self.name, "alignment")
    }

    pub fn set_sorted(&mut self, path: PathBuf) -> Result<(), PipelineError> {
        finalize(&mut self.artifacts.sorted, path, &self.name, "sorted alignment")
    }

    pub fn set_counts(&mut self, path: PathBuf) -> Result<(), PipelineError> {
        finalize(&mut self.artifacts.counts, path, &self.name, "count file")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct References {
    pub genome: PathBuf,
    pub chrom_lengths: PathBuf,
    pub annotation: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRecipient {
    pub email_address: String,
    pub sender_email: String,
    pub sender_password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineManifest {
    pub run_id: String,
    pub samples: Vec<Sample>,
    pub mode: SequencingMode,
    pub references: References,
    pub threads: usize,
    pub index_prefix: String,
    pub out_dir: PathBuf,
    pub phenotype: Option<PathBuf>,
    pub design_formula: String,
    pub report: Option<ReportRecipient>,
}

impl PipelineManifest {
    /// Validates a run request and resolves every file name against the
    /// run directory `<target_path>/<file_name>`.
    ///
    /// # Arguments
    ///
    /// * `request` - Deserialized run request.
    /// * `max_threads` - Upper bound on threads, from the RunConfig.
    ///
    /// # Returns
    /// PipelineManifest, or PipelineError::InvalidManifest.
    pub fn from_request(request: &RunRequest, max_threads: usize) -> Result<Self, PipelineError> {
        let n = request.sample_name_list.len();
        if n == 0 {
            return Err(PipelineError::InvalidManifest("sample_name_list is empty".to_string()));
        }
        if request.grouping_list.len() != n || request.fastq_list.len() != n {
            return Err(PipelineError::InvalidManifest(format!(
                "{} samples, {} group labels and {} fastq entries; all three must match",
                n,
                request.grouping_list.len(),
                request.fastq_list.len()
            )));
        }
        if request.file_name.is_empty() {
            return Err(PipelineError::InvalidManifest("file_name (run id) is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for name in &request.sample_name_list {
            if name.trim().is_empty() {
                return Err(PipelineError::InvalidManifest("empty sample name".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(PipelineError::InvalidManifest(format!("duplicate sample name: {}", name)));
            }
        }

        let run_dir = PathBuf::from(request.run_dir());
        let mut samples = Vec::with_capacity(n);
        for ((name, group), entry) in request
            .sample_name_list
            .iter()
            .zip(&request.grouping_list)
            .zip(&request.fastq_list)
        {
            let reads = match (request.sequencing_type, entry) {
                (SequencingMode::SingleEnd, FastqEntry::Single(f)) => ReadSet::Single(run_dir.join(f)),
                (SequencingMode::PairedEnd, FastqEntry::Paired(r1, r2)) => {
                    ReadSet::Paired(run_dir.join(r1), run_dir.join(r2))
                }
                (mode, _) => {
                    return Err(PipelineError::InvalidManifest(format!(
                        "fastq entry for sample {} does not match sequencing_type {}",
                        name,
                        u8::from(mode)
                    )));
                }
            };
            samples.push(Sample {
                name: name.clone(),
                group: group.clone(),
                reads,
                artifacts: SampleArtifacts::default(),
            });
        }

        let report = match (&request.email_address, &request.sender_email, &request.sender_password) {
            (Some(to), Some(from), Some(password)) => Some(ReportRecipient {
                email_address: to.clone(),
                sender_email: from.clone(),
                sender_password: password.clone(),
            }),
            _ => None,
        };

        Ok(PipelineManifest {
            run_id: request.file_name.clone(),
            samples,
            mode: request.sequencing_type,
            references: References {
                genome: run_dir.join(&request.reference_genome),
                chrom_lengths: run_dir.join(&request.chr_and_length),
                annotation: run_dir.join(&request.gtf),
            },
            threads: request.cpu_num.clamp(1, max_threads.max(1)),
            index_prefix: request.index_prefix.clone(),
            out_dir: run_dir.clone(),
            phenotype: request.phenotype.as_ref().map(|p| run_dir.join(p)),
            design_formula: request
                .design_formula
                .clone()
                .unwrap_or_else(|| DEFAULT_DESIGN_FORMULA.to_string()),
            report,
        })
    }

    pub fn sample_names(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.name.clone()).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_json() -> serde_json::Value {
        json!({
            "sample_name_list": ["s1", "l1"],
            "grouping_list": ["saline", "lps"],
            "chr_and_length": "chr_length.csv",
            "gtf": "genomic.gtf",
            "reference_genome": "genome.fna",
            "sequencing_type": 1,
            "fastq_list": ["s1.fastq", "l1.fastq"],
            "index_prefix": "index_prefix",
            "cpu_num": 30,
            "target_path": "/data/runs",
            "file_name": "12345678"
        })
    }

    #[test]
    fn test_from_request_single_end() -> anyhow::Result<()> {
        let request: RunRequest = serde_json::from_value(request_json())?;
        let manifest = PipelineManifest::from_request(&request, 8)?;

        assert_eq!(manifest.samples.len(), 2);
        assert_eq!(manifest.threads, 8);
        assert_eq!(manifest.out_dir, PathBuf::from("/data/runs/12345678"));
        assert_eq!(
            manifest.samples[0].reads,
            ReadSet::Single(PathBuf::from("/data/runs/12345678/s1.fastq"))
        );
        assert_eq!(manifest.samples[1].group, "lps");
        assert_eq!(manifest.design_formula, "group");
        assert!(manifest.report.is_none());
        Ok(())
    }

    #[test]
    fn test_from_request_paired_end() -> anyhow::Result<()> {
        let mut value = request_json();
        value["sequencing_type"] = json!(2);
        value["fastq_list"] = json!([["s1_1.fq", "s1_2.fq"], ["l1_1.fq", "l1_2.fq"]]);
        let request: RunRequest = serde_json::from_value(value)?;
        let manifest = PipelineManifest::from_request(&request, 64)?;

        assert_eq!(manifest.mode, SequencingMode::PairedEnd);
        assert_eq!(manifest.threads, 30);
        assert_eq!(manifest.samples[1].reads.paths().len(), 2);
        Ok(())
    }

    #[test]
    fn test_from_request_rejects_mismatch() -> anyhow::Result<()> {
        let mut value = request_json();
        value["grouping_list"] = json!(["saline"]);
        let request: RunRequest = serde_json::from_value(value)?;
        let err = PipelineManifest::from_request(&request, 4).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidManifest(_)));

        let mut value = request_json();
        value["fastq_list"] = json!([["a", "b"], "l1.fastq"]);
        let request: RunRequest = serde_json::from_value(value)?;
        assert!(PipelineManifest::from_request(&request, 4).is_err());

        let mut value = request_json();
        value["sample_name_list"] = json!(["s1", "s1"]);
        let request: RunRequest = serde_json::from_value(value)?;
        let err = PipelineManifest::from_request(&request, 4).unwrap_err();
        assert!(err.to_string().contains("duplicate sample name"));
        Ok(())
    }

    #[test]
    fn test_bad_sequencing_type() {
        let mut value = request_json();
        value["sequencing_type"] = json!(3);
        assert!(serde_json::from_value::<RunRequest>(value).is_err());
    }

    #[test]
    fn test_artifacts_finalize_once() -> anyhow::Result<()> {
        let request: RunRequest = serde_json::from_value(request_json())?;
        let mut manifest = PipelineManifest::from_request(&request, 4)?;
        let sample = &mut manifest.samples[0];
        sample.set_sorted(PathBuf::from("a.bam"))?;
        assert!(sample.set_sorted(PathBuf::from("b.bam")).is_err());
        assert_eq!(sample.artifacts.sorted, Some(PathBuf::from("a.bam")));
        Ok(())
    }

    #[test]
    fn test_client_settings_flatten() -> anyhow::Result<()> {
        let mut value = request_json();
        value["file_name"] = json!("");
        value["ssh_server_ip"] = json!("10.0.0.2");
        value["ssh_port"] = json!(22);
        value["username"] = json!("seq");
        value["source_file_list"] = json!(["s1.fastq"]);
        value["api_serve_ip"] = json!("10.0.0.3");
        value["api_port"] = json!(5000);
        let settings: ClientSettings = serde_json::from_value(value)?;
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.retry_delay_secs, 30);
        assert_eq!(settings.request.cpu_num, 30);
        Ok(())
    }
}
