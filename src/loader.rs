//! Resolves a contract instance into a renderer-ready document model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache_key::{CacheKeyInput, ExportFormat};
use crate::error::ExportError;
use crate::read_model::{ClauseVersionRecord, ContractInstanceRecord, ReadModel, SlotType, TemplateSlot};

/// One resolved clause inside a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportClause {
    pub content: String,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSection {
    pub title: String,
    pub clauses: Vec<ExportClause>,
}

/// Document model handed to the renderer. Built per render, then dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData {
    pub contract_title: String,
    pub client_reference: Option<String>,
    pub answers: Map<String, Value>,
    pub sections: Vec<ExportSection>,
    pub template_version_id: String,
    /// Stored template of the requested style, when it resolved.
    pub style_template_path: Option<String>,
}

/// Placeholder content for a clause that should be present but is missing.
pub fn missing_clause_placeholder(clause_version_id: &str) -> String {
    format!("[Klausel nicht gefunden: {clause_version_id}]")
}

pub struct DataLoader {
    read_model: Arc<dyn ReadModel>,
}

impl DataLoader {
    pub fn new(read_model: Arc<dyn ReadModel>) -> Self {
        Self { read_model }
    }

    /// Parameters identifying the render output of a contract in its current
    /// state, without resolving its template.
    pub async fn cache_key_input(
        &self,
        tenant_id: &str,
        contract_instance_id: &str,
        style_template_id: Option<&str>,
        format: ExportFormat,
    ) -> Result<CacheKeyInput, ExportError> {
        let contract = self.load_contract(tenant_id, contract_instance_id).await?;
        Ok(CacheKeyInput {
            contract_instance_id: contract.id,
            clause_version_ids: contract.clause_version_ids,
            answers: contract.answers,
            style_template_id: style_template_id.map(str::to_string),
            format,
        })
    }

    /// Loads everything needed to render `contract_instance_id`.
    ///
    /// Fails only when the contract or its template version is missing.
    /// Missing clauses become visible placeholders and unselected optional
    /// clauses are left out.
    pub async fn load(
        &self,
        tenant_id: &str,
        contract_instance_id: &str,
        style_template_id: Option<&str>,
    ) -> Result<ExportData, ExportError> {
        let contract = self.load_contract(tenant_id, contract_instance_id).await?;

        let template = self
            .read_model
            .template_version(&contract.template_version_id)
            .await
            .map_err(ExportError::ReadModel)?
            .ok_or_else(|| ExportError::TemplateVersionNotFound {
                template_version_id: contract.template_version_id.clone(),
            })?;

        let clauses: HashMap<String, ClauseVersionRecord> = self
            .read_model
            .clause_versions(&contract.clause_version_ids)
            .await
            .map_err(ExportError::ReadModel)?
            .into_iter()
            .map(|clause| (clause.id.clone(), clause))
            .collect();

        let pinned: HashSet<&str> = contract.clause_version_ids.iter().map(String::as_str).collect();

        let sections: Vec<ExportSection> = template
            .structure
            .sections
            .iter()
            .map(|section| ExportSection {
                title: section.title.clone(),
                clauses: section
                    .slots
                    .iter()
                    .filter_map(|slot| resolve_slot(slot, &contract, &pinned, &clauses))
                    .collect(),
            })
            .collect();

        let style_template_path = match style_template_id {
            Some(style_id) => self.resolve_style_template(tenant_id, style_id).await,
            None => None,
        };

        debug!(
            tenant_id = %tenant_id,
            contract_instance_id = %contract_instance_id,
            sections = sections.len(),
            clauses = sections.iter().map(|s| s.clauses.len()).sum::<usize>(),
            "Loaded export data"
        );

        Ok(ExportData {
            contract_title: contract.title,
            client_reference: contract.client_reference,
            answers: contract.answers,
            sections,
            template_version_id: template.id,
            style_template_path,
        })
    }

    /// Sets the tenant context, then loads the contract inside it.
    async fn load_contract(
        &self,
        tenant_id: &str,
        contract_instance_id: &str,
    ) -> Result<ContractInstanceRecord, ExportError> {
        self.read_model
            .set_tenant_context(tenant_id)
            .await
            .map_err(ExportError::ReadModel)?;

        self.read_model
            .contract_instance(tenant_id, contract_instance_id)
            .await
            .map_err(ExportError::ReadModel)?
            .ok_or_else(|| ExportError::ContractNotFound {
                tenant_id: tenant_id.to_string(),
                contract_instance_id: contract_instance_id.to_string(),
            })
    }

    /// Unresolved style templates fall back to the default template later.
    async fn resolve_style_template(&self, tenant_id: &str, style_template_id: &str) -> Option<String> {
        match self.read_model.style_template(tenant_id, style_template_id).await {
            Ok(Some(style)) => Some(style.template_path),
            Ok(None) => {
                warn!(style_template_id = %style_template_id, "Style template not found, using default template");
                None
            }
            Err(e) => {
                warn!(style_template_id = %style_template_id, error = %e, "Style template lookup failed, using default template");
                None
            }
        }
    }
}

fn resolve_slot(
    slot: &TemplateSlot,
    contract: &ContractInstanceRecord,
    pinned: &HashSet<&str>,
    clauses: &HashMap<String, ClauseVersionRecord>,
) -> Option<ExportClause> {
    let active_id = match slot.slot_type {
        SlotType::Required => slot.clause_id.as_str(),
        SlotType::Optional => {
            if !pinned.contains(slot.clause_id.as_str()) {
                return None;
            }
            slot.clause_id.as_str()
        }
        SlotType::Alternative => contract
            .selected_slots
            .get(&slot.clause_id)
            .map(String::as_str)
            .unwrap_or(slot.clause_id.as_str()),
    };

    Some(match clauses.get(active_id) {
        Some(clause) => ExportClause {
            content: clause.content.clone(),
            parameters: clause.parameters.clone(),
        },
        None => {
            warn!(clause_version_id = %active_id, "Clause version not found, rendering placeholder");
            ExportClause {
                content: missing_clause_placeholder(active_id),
                parameters: Map::new(),
            }
        }
    })
}
