use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rnaseq-relay", version = "0.1")]
pub struct Arguments {

    #[arg(short, long, help = "One of: submit, serve, run")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 's', long = "settings", help = "Settings JSON (submit) or run request JSON (run)")]
    pub settings: Option<String>,

    #[arg(short = 'o', long = "out", help = "Output directory override for the run module. Defaults to <target_path>/<file_name> from the request.")]
    pub out_dir: Option<String>,

    #[arg(long, default_value_t = 64)]
    pub threads: usize,

    #[clap(long, help = "Optional fixed seed for run id generation; defaults to OS entropy")]
    pub seed: Option<u64>,

    #[arg(long, default_value = "0.0.0.0:5000")]
    pub bind: String,

    #[arg(long, help = "Kill an external tool and fail the run after this many seconds")]
    pub tool_timeout: Option<u64>,

    #[arg(long, help = "R script that runs the differential expression analysis")]
    pub de_script: Option<String>,

    #[arg(long, default_value = "padj")]
    pub padj_column: String,

    #[arg(long, default_value = "smtp.qq.com")]
    pub smtp_relay: String,

    #[arg(long, default_value_t = 465)]
    pub smtp_port: u16,

    #[arg(long, default_value_t = false, help = "Skip hisat2-build when index files for the prefix already exist")]
    pub reuse_index: bool,
}
