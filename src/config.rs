//! Configuração do jobspawn carregada a partir de `jobspawn.toml`.
//!
//! A struct [`AppConfig`] contém os parâmetros do laço de polling e dos
//! comandos do escalonador. Valores ausentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `JOBSPAWN_POLL_SECS` tem precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::SpawnError;
use crate::state_machine::LifecyclePolicy;

/// Configuração de nível superior carregada de `jobspawn.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Intervalo entre consultas de status, em segundos.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Tempo máximo para cada comando externo (submissão ou consulta).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Consultas consecutivas sem o job antes de considerá-lo terminado.
    #[serde(default = "default_absent_polls_before_done")]
    pub absent_polls_before_done: u32,

    /// Tentativas de submissão antes de desistir de um job.
    /// Sem valor, um job recusado continua em `Created` até ser aceito.
    #[serde(default)]
    pub max_submit_attempts: Option<u32>,

    /// Comando de submissão; o caminho do script é acrescentado ao final.
    #[serde(default = "default_submit_command")]
    pub submit_command: Vec<String>,

    /// Comando de consulta de status em lote.
    #[serde(default = "default_status_command")]
    pub status_command: Vec<String>,

    /// Formato de saída pedido ao comando de status (`<id> <código>`).
    #[serde(default = "default_status_format")]
    pub status_format: String,

    /// Regex de linhas removidas da saída de um job antes da regressão.
    #[serde(default)]
    pub output_filter: Option<String>,
}

// Valor padrão do intervalo de polling: 10s.
fn default_poll_interval_secs() -> u64 {
    10
}

// Valor padrão do timeout de comandos: 60s.
fn default_command_timeout_secs() -> u64 {
    60
}

fn default_absent_polls_before_done() -> u32 {
    2
}

fn default_submit_command() -> Vec<String> {
    vec!["sbatch".to_string()]
}

fn default_status_command() -> Vec<String> {
    vec!["squeue".to_string()]
}

fn default_status_format() -> String {
    "%A %t".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            absent_polls_before_done: default_absent_polls_before_done(),
            max_submit_attempts: None,
            submit_command: default_submit_command(),
            status_command: default_status_command(),
            status_format: default_status_format(),
            output_filter: None,
        }
    }
}

impl AppConfig {
    /// Carrega a configuração de `jobspawn.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, SpawnError> {
        Self::load_from(Path::new("jobspawn.toml"))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self, SpawnError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<AppConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(secs) = std::env::var("JOBSPAWN_POLL_SECS")
            && let Ok(secs) = secs.trim().parse::<u64>()
        {
            config.poll_interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SpawnError> {
        if self.submit_command.is_empty() {
            return Err(SpawnError::Config("submit_command must not be empty".into()));
        }
        if self.status_command.is_empty() {
            return Err(SpawnError::Config("status_command must not be empty".into()));
        }
        if let Some(filter) = &self.output_filter {
            Regex::new(filter).map_err(|e| {
                SpawnError::Config(format!("invalid output_filter <<{filter}>>: {e}"))
            })?;
        }
        if self.max_submit_attempts == Some(0) {
            return Err(SpawnError::Config("max_submit_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Filtro de saída compilado, se configurado.
    pub fn output_filter(&self) -> Result<Option<Regex>, SpawnError> {
        self.output_filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| SpawnError::Config(format!("invalid output_filter: {e}")))
    }

    /// Política de ciclo de vida aplicada a cada job criado nesta execução.
    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            max_submit_attempts: self.max_submit_attempts,
            absent_polls_before_done: self.absent_polls_before_done.max(1),
        }
    }
}
