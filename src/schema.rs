//! Sharding schema info
//!
//! Describes which tables of a sharded database are copied to every shard
//! (reference tables) and which are split across shards by a key column
//! (sharded tables). Schema infos are stored by name in the global store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::handler::{on_schema_info_error_global, ErrorSite};
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode};
use crate::operations::global::ResultHandler;
use crate::operations::{run_global, GlobalRequest, OperationContext};
use crate::store::{StoreError, StoreRequest, StoreSchemaInfo};

const CATEGORY: ShardManagementErrorCategory = ShardManagementErrorCategory::SchemaInfoCollection;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReferenceTableInfo {
    pub schema_name: String,
    pub table_name: String,
}

impl ReferenceTableInfo {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardedTableInfo {
    pub schema_name: String,
    pub table_name: String,
    /// Column holding the sharding key.
    pub key_column_name: String,
}

impl ShardedTableInfo {
    pub fn new(
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        key_column_name: impl Into<String>,
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            key_column_name: key_column_name.into(),
        }
    }
}

/// Tables of a sharded database, by how they are distributed.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaInfo {
    reference_tables: Vec<ReferenceTableInfo>,
    sharded_tables: Vec<ShardedTableInfo>,
}

impl SchemaInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reference_tables(&self) -> &[ReferenceTableInfo] {
        &self.reference_tables
    }

    pub fn sharded_tables(&self) -> &[ShardedTableInfo] {
        &self.sharded_tables
    }

    fn is_reference(&self, schema_name: &str, table_name: &str) -> bool {
        self.reference_tables
            .iter()
            .any(|t| t.schema_name == schema_name && t.table_name == table_name)
    }

    fn is_sharded(&self, schema_name: &str, table_name: &str) -> bool {
        self.sharded_tables
            .iter()
            .any(|t| t.schema_name == schema_name && t.table_name == table_name)
    }

    /// Add a reference table. Adding the same table twice is a no-op.
    pub fn add_reference_table(&mut self, table: ReferenceTableInfo) -> Result<()> {
        if self.is_sharded(&table.schema_name, &table.table_name) {
            return Err(ShardManagementError::invalid_argument(
                CATEGORY,
                format!("{}.{} is already a sharded table", table.schema_name, table.table_name),
            ));
        }
        if !self.reference_tables.contains(&table) {
            self.reference_tables.push(table);
        }
        Ok(())
    }

    /// Add a sharded table. A table can only be sharded on one column.
    pub fn add_sharded_table(&mut self, table: ShardedTableInfo) -> Result<()> {
        if self.is_reference(&table.schema_name, &table.table_name) {
            return Err(ShardManagementError::invalid_argument(
                CATEGORY,
                format!("{}.{} is already a reference table", table.schema_name, table.table_name),
            ));
        }
        if let Some(existing) = self
            .sharded_tables
            .iter()
            .find(|t| t.schema_name == table.schema_name && t.table_name == table.table_name)
        {
            if existing.key_column_name == table.key_column_name {
                return Ok(());
            }
            return Err(ShardManagementError::invalid_argument(
                CATEGORY,
                format!(
                    "{}.{} is already sharded on column {}",
                    table.schema_name, table.table_name, existing.key_column_name
                ),
            ));
        }
        self.sharded_tables.push(table);
        Ok(())
    }

    pub fn remove_reference_table(&mut self, table: &ReferenceTableInfo) -> bool {
        let before = self.reference_tables.len();
        self.reference_tables.retain(|t| t != table);
        self.reference_tables.len() != before
    }

    pub fn remove_sharded_table(&mut self, table: &ShardedTableInfo) -> bool {
        let before = self.sharded_tables.len();
        self.sharded_tables.retain(|t| t != table);
        self.sharded_tables.len() != before
    }

    fn check(&self) -> Result<()> {
        match self
            .reference_tables
            .iter()
            .find(|t| self.is_sharded(&t.schema_name, &t.table_name))
        {
            Some(t) => Err(ShardManagementError::invalid_argument(
                CATEGORY,
                format!("{}.{} is both a reference and a sharded table", t.schema_name, t.table_name),
            )),
            None => Ok(()),
        }
    }

    fn to_store(&self, name: &str) -> Result<StoreSchemaInfo> {
        self.check()?;
        let info = serde_json::to_string(self)
            .map_err(|e| ShardManagementError::from_store_error(CATEGORY, "SerializeSchemaInfo", StoreError::from(e)))?;
        Ok(StoreSchemaInfo {
            name: name.to_string(),
            info,
        })
    }

    fn from_store(stored: &StoreSchemaInfo) -> Result<Self> {
        serde_json::from_str(&stored.info)
            .map_err(|e| ShardManagementError::from_store_error(CATEGORY, "DeserializeSchemaInfo", StoreError::from(e)))
    }
}

impl fmt::Display for SchemaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reference tables, {} sharded tables",
            self.reference_tables.len(),
            self.sharded_tables.len()
        )
    }
}

/// Named schema infos kept in the global store.
pub struct SchemaInfoCollection {
    ctx: OperationContext,
}

impl SchemaInfoCollection {
    pub(crate) fn new(ctx: OperationContext) -> Self {
        Self { ctx }
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ShardManagementError::invalid_argument(CATEGORY, "schema info name must not be empty"));
        }
        Ok(())
    }

    fn run(&self, operation: &str, name: &str, request: StoreRequest, read_only: bool) -> Result<Vec<StoreSchemaInfo>> {
        let handler: ResultHandler<'_> = &|result, site: &ErrorSite<'_>| on_schema_info_error_global(result, name, site);
        let mut request = GlobalRequest::new(operation, CATEGORY, request, handler);
        if read_only {
            request = request.read_only();
        }
        Ok(run_global(&self.ctx, &request)?.schema_info)
    }

    pub fn add(&self, name: &str, schema_info: &SchemaInfo) -> Result<()> {
        Self::check_name(name)?;
        let schema_info = schema_info.to_store(name)?;
        self.run("AddSchemaInfo", name, StoreRequest::AddSchemaInfoGlobal { schema_info }, false)?;
        log::info!("added schema info '{}'", name);
        Ok(())
    }

    pub fn replace(&self, name: &str, schema_info: &SchemaInfo) -> Result<()> {
        Self::check_name(name)?;
        let schema_info = schema_info.to_store(name)?;
        self.run("ReplaceSchemaInfo", name, StoreRequest::UpdateSchemaInfoGlobal { schema_info }, false)?;
        Ok(())
    }

    pub fn try_get(&self, name: &str) -> Result<Option<SchemaInfo>> {
        match self.get(name) {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.code == ShardManagementErrorCode::SchemaInfoNameDoesNotExist => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, name: &str) -> Result<SchemaInfo> {
        Self::check_name(name)?;
        let stored = self.run(
            "GetSchemaInfo",
            name,
            StoreRequest::FindSchemaInfoGlobal { name: name.to_string() },
            true,
        )?;
        match stored.first() {
            Some(stored) => SchemaInfo::from_store(stored),
            None => Err(ErrorSite::new(CATEGORY, "GetSchemaInfo").error(
                ShardManagementErrorCode::SchemaInfoNameDoesNotExist,
                format!("schema info '{}' does not exist", name),
            )),
        }
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        Self::check_name(name)?;
        self.run(
            "RemoveSchemaInfo",
            name,
            StoreRequest::RemoveSchemaInfoGlobal { name: name.to_string() },
            false,
        )?;
        log::info!("removed schema info '{}'", name);
        Ok(())
    }

    /// Every stored schema info, by name.
    pub fn get_all(&self) -> Result<Vec<(String, SchemaInfo)>> {
        self.run("GetAllSchemaInfos", "", StoreRequest::GetAllSchemaInfosGlobal, true)?
            .iter()
            .map(|stored| Ok((stored.name.clone(), SchemaInfo::from_store(stored)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;

    fn orders_schema() -> SchemaInfo {
        let mut info = SchemaInfo::new();
        info.add_reference_table(ReferenceTableInfo::new("dbo", "regions")).unwrap();
        info.add_sharded_table(ShardedTableInfo::new("dbo", "orders", "customer_id"))
            .unwrap();
        info
    }

    #[test]
    fn test_table_cannot_be_both_kinds() {
        let mut info = orders_schema();
        let err = info
            .add_reference_table(ReferenceTableInfo::new("dbo", "orders"))
            .err()
            .unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::InvalidArgument);
        let err = info
            .add_sharded_table(ShardedTableInfo::new("dbo", "regions", "id"))
            .err()
            .unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::InvalidArgument);

        // Same table on another key column.
        let err = info
            .add_sharded_table(ShardedTableInfo::new("dbo", "orders", "order_id"))
            .err()
            .unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::InvalidArgument);

        info.add_sharded_table(ShardedTableInfo::new("dbo", "orders", "customer_id"))
            .unwrap();
        assert_eq!(info.sharded_tables().len(), 1);
        assert!(info.remove_reference_table(&ReferenceTableInfo::new("dbo", "regions")));
        assert!(!info.remove_reference_table(&ReferenceTableInfo::new("dbo", "regions")));
    }

    #[test]
    fn test_collection_round_trip() {
        let harness = Harness::new();
        let collection = harness.manager.schema_info_collection();
        let info = orders_schema();

        collection.add("orders", &info).unwrap();
        assert_eq!(collection.get("orders").unwrap(), info);

        let err = collection.add("orders", &info).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::SchemaInfoNameConflict);

        let mut updated = info.clone();
        updated
            .add_reference_table(ReferenceTableInfo::new("dbo", "currencies"))
            .unwrap();
        collection.replace("orders", &updated).unwrap();
        assert_eq!(collection.get("orders").unwrap().reference_tables().len(), 2);

        let all = collection.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "orders");

        collection.remove("orders").unwrap();
        assert!(collection.try_get("orders").unwrap().is_none());
        let err = collection.remove("orders").err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::SchemaInfoNameDoesNotExist);
        let err = collection.replace("missing", &info).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::SchemaInfoNameDoesNotExist);
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let harness = Harness::new();
        let err = harness
            .manager
            .schema_info_collection()
            .add("", &SchemaInfo::new())
            .err()
            .unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::InvalidArgument);
    }
}
