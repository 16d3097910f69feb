/// Functions and structs for building external tool command lines

use std::fmt;
use anyhow::{anyhow, Result};
use log::{debug, info};
use crate::config::defs::{PipelineError, STDERR_CHATTER};
use crate::utils::invoker::ToolInvoker;


/// A program plus its argument list. Never passed through a shell.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Whether stderr output on a zero exit is normal for this tool.
    pub stderr_is_diagnostic: bool,
}

impl ToolCommand {
    pub fn new(program: &str) -> Self {
        ToolCommand {
            program: program.to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            stderr_is_diagnostic: STDERR_CHATTER.get(program).copied().unwrap_or(false),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}


pub mod fastp {
    use std::path::Path;
    use crate::config::defs::{PipelineError, FASTP_TAG};
    use crate::config::manifest::ReadSet;
    use super::ToolCommand;

    /// Input and output must share a layout.
    pub fn arg_generator(input: &ReadSet, output: &ReadSet, threads: usize) -> Result<Vec<String>, PipelineError> {
        let mut args_vec: Vec<String> = Vec::new();
        let mut push_pair = |flag: &str, path: &Path| {
            args_vec.push(flag.to_string());
            args_vec.push(path.to_string_lossy().to_string());
        };
        match (input, output) {
            (ReadSet::Paired(r1, r2), ReadSet::Paired(o1, o2)) => {
                push_pair("-i", r1);
                push_pair("-I", r2);
                push_pair("-o", o1);
                push_pair("-O", o2);
            }
            (ReadSet::Single(r1), ReadSet::Single(o1)) => {
                push_pair("-i", r1);
                push_pair("-o", o1);
            }
            (input, output) => {
                return Err(PipelineError::InvalidConfig(format!(
                    "fastp cannot trim {} input file(s) into {} output file(s)",
                    input.paths().len(),
                    output.paths().len()
                )));
            }
        }
        args_vec.push("-w".to_string());
        args_vec.push(threads.to_string());
        Ok(args_vec)
    }

    pub fn command(input: &ReadSet, output: &ReadSet, threads: usize) -> Result<ToolCommand, PipelineError> {
        Ok(ToolCommand::new(FASTP_TAG).args(arg_generator(input, output, threads)?))
    }
}

pub mod hisat2 {
    use std::path::Path;
    use crate::config::defs::{HISAT2_BUILD_TAG, HISAT2_TAG};
    use crate::config::manifest::ReadSet;
    use super::ToolCommand;

    pub fn build_arg_generator(genome: &Path, index_prefix: &Path, threads: usize) -> Vec<String> {
        vec![
            "-p".to_string(),
            threads.to_string(),
            genome.to_string_lossy().to_string(),
            index_prefix.to_string_lossy().to_string(),
        ]
    }

    pub fn build_command(genome: &Path, index_prefix: &Path, threads: usize) -> ToolCommand {
        ToolCommand::new(HISAT2_BUILD_TAG).args(build_arg_generator(genome, index_prefix, threads))
    }

    pub fn align_arg_generator(index_prefix: &Path, reads: &ReadSet, sam_out: &Path, threads: usize) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-p".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("-x".to_string());
        args_vec.push(index_prefix.to_string_lossy().to_string());
        match reads {
            ReadSet::Single(fq) => {
                args_vec.push("-U".to_string());
                args_vec.push(fq.to_string_lossy().to_string());
            }
            ReadSet::Paired(r1, r2) => {
                args_vec.push("-1".to_string());
                args_vec.push(r1.to_string_lossy().to_string());
                args_vec.push("-2".to_string());
                args_vec.push(r2.to_string_lossy().to_string());
            }
        }
        args_vec.push("-S".to_string());
        args_vec.push(sam_out.to_string_lossy().to_string());
        args_vec
    }

    pub fn align_command(index_prefix: &Path, reads: &ReadSet, sam_out: &Path, threads: usize) -> ToolCommand {
        ToolCommand::new(HISAT2_TAG).args(align_arg_generator(index_prefix, reads, sam_out, threads))
    }
}

pub mod samtools {
    use std::path::Path;
    use crate::config::defs::{SamtoolsSubcommand, SAMTOOLS_TAG};
    use super::ToolCommand;

    pub struct SamtoolsConfig {
        pub subcommand: SamtoolsSubcommand,
        pub threads: usize,
    }

    pub fn arg_generator(config: &SamtoolsConfig, input: &Path, output: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        match config.subcommand {
            SamtoolsSubcommand::Sort => {
                args_vec.push("sort".to_string());
                args_vec.push("-@".to_string());
                args_vec.push(config.threads.to_string());
                args_vec.push("-o".to_string());
                args_vec.push(output.to_string_lossy().to_string());
                args_vec.push(input.to_string_lossy().to_string());
            }
        }
        args_vec
    }

    pub fn command(config: &SamtoolsConfig, input: &Path, output: &Path) -> ToolCommand {
        ToolCommand::new(SAMTOOLS_TAG).args(arg_generator(config, input, output))
    }
}

pub mod htseq {
    use std::path::Path;
    use crate::config::defs::HTSEQ_COUNT_TAG;
    use super::ToolCommand;

    pub fn arg_generator(sorted_bam: &Path, annotation: &Path) -> Vec<String> {
        vec![
            "-m".to_string(),
            "union".to_string(),
            "-f".to_string(),
            "bam".to_string(),
            sorted_bam.to_string_lossy().to_string(),
            annotation.to_string_lossy().to_string(),
        ]
    }

    pub fn command(sorted_bam: &Path, annotation: &Path) -> ToolCommand {
        ToolCommand::new(HTSEQ_COUNT_TAG).args(arg_generator(sorted_bam, annotation))
    }
}

pub mod rscript {
    use std::path::Path;
    use crate::config::defs::RSCRIPT_TAG;
    use super::ToolCommand;

    pub fn command(script: &Path, counts: &Path, phenotype: &Path, design: &str, output: &Path) -> ToolCommand {
        ToolCommand::new(RSCRIPT_TAG).args([
            script.to_string_lossy().to_string(),
            counts.to_string_lossy().to_string(),
            phenotype.to_string_lossy().to_string(),
            design.to_string(),
            output.to_string_lossy().to_string(),
        ])
    }
}


/// Pulls a version token out of `<tool> --version` output. Some tools
/// report on stdout, others (fastp, older Rscript) on stderr.
fn parse_version(tool: &str, stdout: &str, stderr: &str) -> Result<String> {
    let first_line = stdout
        .lines()
        .chain(stderr.lines())
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("No output from {} --version", tool))?;
    let version = first_line
        .split_whitespace()
        .find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .or_else(|| first_line.split_whitespace().last())
        .ok_or_else(|| anyhow!("Invalid {} --version output: {}", tool, first_line))?
        .to_string();
    Ok(version)
}

pub async fn check_version(invoker: &dyn ToolInvoker, tool: &str) -> Result<String, PipelineError> {
    let command = ToolCommand::new(tool).arg("--version");
    let outcome = invoker.invoke(&command).await?;
    if !outcome.success() {
        return Err(PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: format!("version probe exited with {}: {}", outcome.status_label(), outcome.stderr.trim()),
        });
    }
    parse_version(tool, &outcome.stdout, &outcome.stderr).map_err(|e| PipelineError::ToolExecution {
        tool: tool.to_string(),
        error: e.to_string(),
    })
}

/// Probes every tool a run needs before any stage starts.
pub async fn check_versions(invoker: &dyn ToolInvoker, tools: &[&str]) -> Result<(), PipelineError> {
    for tool in tools {
        let version = check_version(invoker, tool).await?;
        debug!("{} version {}", tool, version);
    }
    info!("Found all required tools: {}", tools.join(", "));
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use crate::config::defs::SamtoolsSubcommand;
    use crate::config::manifest::ReadSet;

    #[test]
    fn test_fastp_paired_args() -> Result<()> {
        let input = ReadSet::Paired(PathBuf::from("a_1.fq"), PathBuf::from("a_2.fq"));
        let output = ReadSet::Paired(PathBuf::from("out/a_r1.fq"), PathBuf::from("out/a_r2.fq"));
        let cmd = fastp::command(&input, &output, 4)?;
        assert_eq!(cmd.program, "fastp");
        assert_eq!(
            cmd.args,
            vec!["-i", "a_1.fq", "-I", "a_2.fq", "-o", "out/a_r1.fq", "-O", "out/a_r2.fq", "-w", "4"]
        );
        assert!(cmd.stderr_is_diagnostic);
        Ok(())
    }

    #[test]
    fn test_fastp_rejects_mixed_layouts() {
        let paired = ReadSet::Paired(PathBuf::from("a_1.fq"), PathBuf::from("a_2.fq"));
        let single = ReadSet::Single(PathBuf::from("out/a.fq"));
        assert!(matches!(
            fastp::command(&paired, &single, 4),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(fastp::arg_generator(&single, &paired, 4).is_err());
    }

    #[test]
    fn test_hisat2_single_args() {
        let reads = ReadSet::Single(PathBuf::from("s1.fq"));
        let cmd = hisat2::align_command(Path::new("out/idx"), &reads, Path::new("out/s1.sam"), 8);
        assert_eq!(cmd.to_string(), "hisat2 -p 8 -x out/idx -U s1.fq -S out/s1.sam");
    }

    #[test]
    fn test_samtools_sort_args() {
        let config = samtools::SamtoolsConfig { subcommand: SamtoolsSubcommand::Sort, threads: 2 };
        let cmd = samtools::command(&config, Path::new("s1.sam"), Path::new("s1_sorted.bam"));
        assert_eq!(cmd.args, vec!["sort", "-@", "2", "-o", "s1_sorted.bam", "s1.sam"]);
        assert!(!cmd.stderr_is_diagnostic);
    }

    #[test]
    fn test_file_names_with_spaces_stay_single_args() {
        let cmd = htseq::command(Path::new("my dir/s 1.bam"), Path::new("genes.gtf"));
        assert_eq!(cmd.args[4], "my dir/s 1.bam");
        assert_eq!(cmd.args.len(), 6);
    }

    #[test]
    fn test_parse_version() -> Result<()> {
        assert_eq!(parse_version("samtools", "samtools 1.20\nUsing htslib 1.20\n", "")?, "1.20");
        assert_eq!(parse_version("fastp", "", "fastp 0.23.4\n")?, "0.23.4");
        assert!(parse_version("hisat2", "", "").is_err());
        Ok(())
    }
}
