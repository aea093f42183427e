//! Interface de linha de comando do jobspawn baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, show, compare)
//! e a flag global `--verbose`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// jobspawn: gera, submete e acompanha suítes de jobs em lote.
#[derive(Debug, Parser)]
#[command(name = "jobspawn", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa todas as suítes de um arquivo de configuração.
    Run {
        /// Arquivo de configuração da suíte.
        #[arg(short, long)]
        config: PathBuf,

        /// Gera os scripts sem submeter nada.
        #[arg(short, long, conflicts_with = "regress_only")]
        test: bool,

        /// Não submete; aplica a regressão às saídas já existentes.
        #[arg(long)]
        regress_only: bool,

        /// Intervalo de polling em segundos (sobrepõe jobspawn.toml).
        #[arg(long)]
        poll_secs: Option<u64>,

        /// Novo limite de concorrência para uma fila declarada (`FILA=N`).
        #[arg(long = "limit", value_name = "QUEUE=N", value_parser = parse_limit)]
        limits: Vec<(String, usize)>,
    },

    /// Mostra as suítes e a matriz de jobs sem escrever nada.
    Show {
        /// Arquivo de configuração da suíte.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Compara dois diretórios de resultados de regressão.
    Compare {
        /// Diretório com os resultados de referência.
        baseline: PathBuf,

        /// Diretório com os resultados atuais.
        current: PathBuf,

        /// Diferença relativa máxima aceita (0.1 = 10%).
        #[arg(long, default_value_t = 0.1)]
        tolerance: f64,
    },
}

/// Lê um par `FILA=N` com N positivo.
fn parse_limit(raw: &str) -> Result<(String, usize), String> {
    let (queue, limit) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected QUEUE=N, got <<{raw}>>"))?;
    let limit = limit
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| format!("limit for <<{queue}>> must be a positive integer"))?;
    Ok((queue.trim().to_string(), limit))
}
