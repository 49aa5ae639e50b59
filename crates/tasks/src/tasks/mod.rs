//! Built-in task functions.

mod create;
mod create_or_update;
mod delete;
mod publish;
mod query;
mod realtime;
mod restore;
mod revert;
mod token;
mod update;
mod utility;

pub use create::CreateDocTask;
pub use create_or_update::CreateOrUpdateDocTask;
pub use delete::DeleteDocTask;
pub use publish::BusPublishTask;
pub use query::QueryTask;
pub use realtime::{namespace_path, EmitEventTask, PrepNamespaceTask};
pub use restore::RestoreDocTask;
pub use revert::RevertDocTask;
pub use token::CreateTokenTask;
pub use update::UpdateDocTask;
pub use utility::{AddContextTask, RandomStringTask, StringToHashTask};

use serde_json::{Map, Value};

use crate::definition::TaskDefinition;
use crate::error::TaskError;
use crate::registry::TaskRegistry;
use crate::util::collection_from_id;

/// Create a registry with every built-in task function.
pub fn create_default_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    registry.register(QueryTask);
    registry.register(CreateDocTask);
    registry.register(UpdateDocTask);
    registry.register(DeleteDocTask);
    registry.register(RevertDocTask);
    registry.register(RestoreDocTask);
    registry.register(CreateOrUpdateDocTask);
    registry.register(AddContextTask);
    registry.register(CreateTokenTask);
    registry.register(StringToHashTask);
    registry.register(RandomStringTask);
    registry.register(EmitEventTask);
    registry.register(PrepNamespaceTask);
    registry.register(BusPublishTask);

    registry
}

/// Non-empty string parameter or `InvalidDefinition`.
pub(crate) fn require_str<'a>(task: &'a TaskDefinition, key: &str) -> Result<&'a str, TaskError> {
    task.param_str(key).ok_or(TaskError::InvalidDefinition)
}

/// `InvalidDefinition` unless `id` is `<collection>~...`.
pub(crate) fn require_id_in(id: &str, collection: &str) -> Result<(), TaskError> {
    if collection_from_id(id) == Some(collection) {
        Ok(())
    } else {
        Err(TaskError::InvalidDefinition)
    }
}

/// Object-valued document body, or `InvalidDefinition`.
pub(crate) fn into_object(value: Value) -> Result<Map<String, Value>, TaskError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(TaskError::InvalidDefinition),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_catalog() {
        let registry = create_default_registry();
        assert_eq!(
            registry.list(),
            vec![
                "bus_publish",
                "db_create_doc",
                "db_create_or_update_doc",
                "db_delete_doc",
                "db_query",
                "db_restore_doc",
                "db_revert_doc",
                "db_update_doc",
                "util_add_context",
                "util_create_token",
                "util_random_string",
                "util_string_to_hash",
                "ws_emit_event",
                "ws_prep_namespace",
            ]
        );
    }

    #[test]
    fn test_require_str() {
        let task = TaskDefinition::new("x", serde_json::json!({ "id": "users~1", "empty": "" }));
        assert_eq!(require_str(&task, "id").unwrap(), "users~1");
        assert!(matches!(require_str(&task, "empty"), Err(TaskError::InvalidDefinition)));
        assert!(matches!(require_str(&task, "missing"), Err(TaskError::InvalidDefinition)));
    }
}
