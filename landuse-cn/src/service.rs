//! Service hydrologique servant une table de résultats déjà téléchargée

use std::path::PathBuf;

use tracing::info;

use curvenumber::runoff::{HydroModelService, JobHandle, JobRequest, JobStatus};
use curvenumber::table::{read_table, Table};
use curvenumber::CnError;

use crate::config::ServiceConfig;

/// Rejoue la sortie `output` d'un job distant à partir d'un fichier local
#[derive(Debug, Clone)]
pub struct PrecomputedTableService {
    table_path: PathBuf,
    endpoint: Option<String>,
    process_identifier: String,
}

impl PrecomputedTableService {
    pub fn new(table_path: impl Into<PathBuf>) -> Self {
        Self {
            table_path: table_path.into(),
            endpoint: None,
            process_identifier: String::new(),
        }
    }

    /// Associe la description du service distant dont la table est issue
    pub fn with_service(mut self, service: &ServiceConfig) -> Self {
        self.endpoint = Some(service.url.clone());
        self.process_identifier = service.process_identifier.clone();
        self
    }

    /// Identifiant du job: processus et service d'origine, ou le fichier seul
    fn job_id(&self) -> String {
        match &self.endpoint {
            Some(url) => format!("{}@{}", self.process_identifier, url),
            None => format!("precomputed:{}", self.table_path.display()),
        }
    }
}

impl HydroModelService for PrecomputedTableService {
    fn submit(&self, request: &JobRequest) -> Result<JobHandle, CnError> {
        if !self.table_path.exists() {
            return Err(CnError::RemoteService(format!(
                "result table not found: {}",
                self.table_path.display()
            )));
        }
        info!(
            endpoint = self.endpoint.as_deref().unwrap_or("-"),
            process = %self.process_identifier,
            periods = ?request.return_periods,
            table = %self.table_path.display(),
            "Serving precomputed result table"
        );
        Ok(JobHandle { id: self.job_id() })
    }

    fn status(&self, _job: &JobHandle) -> Result<JobStatus, CnError> {
        Ok(JobStatus::Succeeded)
    }

    fn fetch_table(&self, _job: &JobHandle, _output: &str) -> Result<Table, CnError> {
        read_table(&self.table_path)
    }
}
