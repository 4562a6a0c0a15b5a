//! Tenant-scoped read model of contracts, templates and clauses.
//!
//! The API service owns the relational data and projects what the worker needs
//! into Redis as JSON documents. Tenant-owned records live under a per-tenant
//! key prefix; template and clause versions are immutable and global.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::error::StorageError;

/// Default key prefix of the read-model projection.
pub const DEFAULT_PREFIX: &str = "contracts:read";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInstanceRecord {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    #[serde(default)]
    pub client_reference: Option<String>,
    pub template_version_id: String,
    /// Clause versions pinned on this contract.
    #[serde(default)]
    pub clause_version_ids: Vec<String>,
    #[serde(default)]
    pub answers: Map<String, Value>,
    /// Alternative-slot overrides: primary clause id -> chosen clause id.
    #[serde(default)]
    pub selected_slots: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    Required,
    Optional,
    Alternative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSlot {
    pub clause_id: String,
    #[serde(rename = "type")]
    pub slot_type: SlotType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSection {
    pub title: String,
    #[serde(default)]
    pub slots: Vec<TemplateSlot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStructure {
    #[serde(default)]
    pub sections: Vec<TemplateSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVersionRecord {
    pub id: String,
    #[serde(default)]
    pub structure: TemplateStructure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClauseVersionRecord {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleTemplateRecord {
    pub id: String,
    /// Object path of the stored DOCX template.
    pub template_path: String,
}

/// Historical export count of one template version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateUsage {
    pub template_version_id: String,
    /// Document template last used to export this version.
    pub template_path: String,
    pub export_count: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadModel: Send + Sync {
    /// Establishes the tenant isolation context. Must precede every other
    /// query issued on behalf of that tenant.
    async fn set_tenant_context(&self, tenant_id: &str) -> Result<(), StorageError>;

    async fn contract_instance(
        &self,
        tenant_id: &str,
        contract_instance_id: &str,
    ) -> Result<Option<ContractInstanceRecord>, StorageError>;

    async fn template_version(
        &self,
        template_version_id: &str,
    ) -> Result<Option<TemplateVersionRecord>, StorageError>;

    /// Batch lookup; ids without a record are simply absent from the result.
    async fn clause_versions(&self, ids: &[String]) -> Result<Vec<ClauseVersionRecord>, StorageError>;

    async fn style_template(
        &self,
        tenant_id: &str,
        style_template_id: &str,
    ) -> Result<Option<StyleTemplateRecord>, StorageError>;

    /// Template versions ordered by descending export count.
    async fn top_templates_by_exports(&self, limit: usize) -> Result<Vec<TemplateUsage>, StorageError>;

    /// Counts one export of `template_version_id` rendered with `template_path`.
    async fn record_export(
        &self,
        template_version_id: &str,
        template_path: &str,
    ) -> Result<(), StorageError>;
}

/// Redis projection of the read model.
///
/// Key layout (with the default prefix):
/// - `contracts:read:{tenant}:contract:{id}` JSON contract instance
/// - `contracts:read:{tenant}:style-template:{id}` JSON style template
/// - `contracts:read:template-version:{id}` JSON template version
/// - `contracts:read:clause-version:{id}` JSON clause version
/// - `contracts:read:export-frequency` sorted set, score = exports
/// - `contracts:read:template-paths` hash, template version -> template path
pub struct RedisReadModel {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisReadModel {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_prefix(conn, DEFAULT_PREFIX)
    }

    pub fn with_prefix(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn contract_key(&self, tenant_id: &str, id: &str) -> String {
        format!("{}:{}:contract:{}", self.prefix, tenant_id, id)
    }

    fn style_template_key(&self, tenant_id: &str, id: &str) -> String {
        format!("{}:{}:style-template:{}", self.prefix, tenant_id, id)
    }

    fn template_version_key(&self, id: &str) -> String {
        format!("{}:template-version:{}", self.prefix, id)
    }

    fn clause_version_key(&self, id: &str) -> String {
        format!("{}:clause-version:{}", self.prefix, id)
    }

    fn frequency_key(&self) -> String {
        format!("{}:export-frequency", self.prefix)
    }

    fn template_paths_key(&self) -> String {
        format!("{}:template-paths", self.prefix)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Writes the projection of a contract instance. Used by the API service
    /// side of the projection and by fixtures.
    pub async fn put_contract_instance(&self, record: &ContractInstanceRecord) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(self.contract_key(&record.tenant_id, &record.id), json)
            .await?;
        Ok(())
    }

    pub async fn put_template_version(&self, record: &TemplateVersionRecord) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(self.template_version_key(&record.id), json)
            .await?;
        Ok(())
    }

    pub async fn put_clause_version(&self, record: &ClauseVersionRecord) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(self.clause_version_key(&record.id), json)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReadModel for RedisReadModel {
    /// Tenant-owned keys embed the tenant id, so the context is the id
    /// itself. Unknown tenants are fine (their lookups find nothing); ids that
    /// would escape the key namespace are rejected.
    async fn set_tenant_context(&self, tenant_id: &str) -> Result<(), StorageError> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(StorageError::TenantContext {
                tenant_id: tenant_id.to_string(),
            });
        }
        debug!(tenant_id = %tenant_id, "Tenant context established");
        Ok(())
    }

    async fn contract_instance(
        &self,
        tenant_id: &str,
        contract_instance_id: &str,
    ) -> Result<Option<ContractInstanceRecord>, StorageError> {
        let record: Option<ContractInstanceRecord> = self
            .get_json(&self.contract_key(tenant_id, contract_instance_id))
            .await?;
        // The projection is keyed by tenant already; a mismatching body means
        // a corrupt projection and is treated as not visible.
        Ok(record.filter(|r| r.tenant_id == tenant_id))
    }

    async fn template_version(
        &self,
        template_version_id: &str,
    ) -> Result<Option<TemplateVersionRecord>, StorageError> {
        self.get_json(&self.template_version_key(template_version_id))
            .await
    }

    async fn clause_versions(&self, ids: &[String]) -> Result<Vec<ClauseVersionRecord>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.clause_version_key(id)).collect();
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut records = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            records.push(serde_json::from_str(&json)?);
        }
        Ok(records)
    }

    async fn style_template(
        &self,
        tenant_id: &str,
        style_template_id: &str,
    ) -> Result<Option<StyleTemplateRecord>, StorageError> {
        self.get_json(&self.style_template_key(tenant_id, style_template_id))
            .await
    }

    async fn top_templates_by_exports(&self, limit: usize) -> Result<Vec<TemplateUsage>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let ranked: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(self.frequency_key())
            .arg(0)
            .arg(limit as isize - 1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = ranked.iter().map(|(id, _)| id.as_str()).collect();
        let paths: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.template_paths_key())
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        Ok(ranked
            .into_iter()
            .zip(paths)
            .filter_map(|((template_version_id, score), path)| {
                path.map(|template_path| TemplateUsage {
                    template_version_id,
                    template_path,
                    export_count: score.max(0.0) as u64,
                })
            })
            .collect())
    }

    async fn record_export(
        &self,
        template_version_id: &str,
        template_path: &str,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zincr(self.frequency_key(), template_version_id, 1)
            .ignore()
            .hset(self.template_paths_key(), template_version_id, template_path)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

fn is_valid_tenant_id(tenant_id: &str) -> bool {
    !tenant_id.is_empty()
        && !tenant_id
            .chars()
            .any(|c| c == ':' || c == '*' || c.is_whitespace() || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_contract_instance_deserializes_with_defaults() {
        let record: ContractInstanceRecord = serde_json::from_value(json!({
            "id": "ci-1",
            "tenantId": "t-1",
            "title": "Kaufvertrag",
            "templateVersionId": "tv-1"
        }))
        .unwrap();

        assert_eq!(record.client_reference, None);
        assert!(record.clause_version_ids.is_empty());
        assert!(record.answers.is_empty());
        assert!(record.selected_slots.is_empty());
    }

    #[test]
    fn test_template_structure_wire_format() {
        let record: TemplateVersionRecord = serde_json::from_value(json!({
            "id": "tv-1",
            "structure": {
                "sections": [
                    {
                        "title": "Gegenstand",
                        "slots": [
                            { "clauseId": "c-1", "type": "required" },
                            { "clauseId": "c-2", "type": "alternative" }
                        ]
                    },
                    { "title": "Sonstiges", "slots": [{ "clauseId": "c-3", "type": "optional" }] }
                ]
            }
        }))
        .unwrap();

        assert_eq!(record.structure.sections.len(), 2);
        assert_eq!(
            record.structure.sections[0].slots[1],
            TemplateSlot {
                clause_id: "c-2".to_string(),
                slot_type: SlotType::Alternative
            }
        );
        assert_eq!(record.structure.sections[1].slots[0].slot_type, SlotType::Optional);
    }

    #[test]
    fn test_tenant_ids_must_stay_inside_their_key_namespace() {
        assert!(is_valid_tenant_id("tenant-a"));
        assert!(is_valid_tenant_id("7f3c2a90-0d1e-4b6a-9f57-1a2b3c4d5e6f"));
        assert!(!is_valid_tenant_id(""));
        assert!(!is_valid_tenant_id("tenant-a:contract"));
        assert!(!is_valid_tenant_id("tenant *"));
    }

    // Requires a running Redis instance:
    // docker run -d -p 6379:6379 redis:7-alpine
    #[tokio::test]
    #[ignore]
    async fn test_redis_projection_round_trip() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let model = RedisReadModel::with_prefix(conn, format!("test:{}", uuid::Uuid::new_v4()));

        let contract = ContractInstanceRecord {
            id: "ci-1".to_string(),
            tenant_id: "t-1".to_string(),
            title: "Kaufvertrag".to_string(),
            client_reference: Some("K-17".to_string()),
            template_version_id: "tv-1".to_string(),
            clause_version_ids: vec!["cv-1".to_string(), "cv-2".to_string()],
            answers: Map::new(),
            selected_slots: HashMap::new(),
        };
        model.put_contract_instance(&contract).await.unwrap();
        model
            .put_clause_version(&ClauseVersionRecord {
                id: "cv-1".to_string(),
                content: "Text".to_string(),
                parameters: Map::new(),
            })
            .await
            .unwrap();

        model.set_tenant_context("t-1").await.unwrap();
        model.set_tenant_context("t-unknown").await.unwrap();
        assert_eq!(model.contract_instance("t-unknown", "ci-1").await.unwrap(), None);
        assert_eq!(model.contract_instance("t-1", "ci-1").await.unwrap(), Some(contract));
        assert_eq!(model.contract_instance("t-2", "ci-1").await.unwrap(), None);

        let clauses = model
            .clause_versions(&["cv-1".to_string(), "cv-2".to_string()])
            .await
            .unwrap();
        assert_eq!(clauses.len(), 1);

        model.record_export("tv-1", "templates/a.docx").await.unwrap();
        model.record_export("tv-1", "templates/a.docx").await.unwrap();
        model.record_export("tv-2", "templates/b.docx").await.unwrap();
        let top = model.top_templates_by_exports(5).await.unwrap();
        assert_eq!(top[0].template_version_id, "tv-1");
        assert_eq!(top[0].export_count, 2);
        assert_eq!(top.len(), 2);
    }
}
