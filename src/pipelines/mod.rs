pub mod de;
pub mod rna_seq;
pub mod server;
pub mod submit;
