//! Tipos de erro para o cliente do escalonador.
//!
//! Define [`SchedulerError`] com variantes para submissão recusada, timeout
//! e falhas ao executar o comando externo. Usa `thiserror` para derivar
//! `Display` e `Error` a partir dos atributos `#[error(...)]`.

use std::path::PathBuf;

use thiserror::Error;

/// Erros que podem ocorrer ao falar com o escalonador externo.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A saída do comando de submissão não contém a linha `Submitted ... <id>`.
    #[error("submission failed for {}: {output}", script.display())]
    SubmitRejected { script: PathBuf, output: String },

    /// O comando não terminou dentro do limite configurado.
    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// Não foi possível iniciar o processo externo.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A saída do processo não é UTF-8 válido.
    #[error("{command} produced non UTF-8 output")]
    NonUtf8Output { command: String },
}
