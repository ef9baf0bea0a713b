use std::path::Path;
use log::info;
use uuid::Uuid;

const ID_FILE: &str = "node.id";

/// Fresh random node id (UUID v4)
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Resolve this node's identity.
///
/// An explicit id wins. Otherwise the id persisted in `data_dir` is reused,
/// or a new one is generated and written there so restarts keep the same
/// identity. Without a data dir the id lives only as long as the process.
pub fn resolve_node_id(explicit: Option<&str>, data_dir: Option<&str>) -> std::io::Result<String> {
    if let Some(id) = explicit {
        return Ok(id.to_string());
    }

    let Some(dir) = data_dir else {
        return Ok(generate_id());
    };

    let path = Path::new(dir).join(ID_FILE);
    if path.exists() {
        let id = std::fs::read_to_string(&path)?.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }

    std::fs::create_dir_all(dir)?;
    let id = generate_id();
    std::fs::write(&path, &id)?;
    info!("Generated node id {} at {:?}", id, path);
    Ok(id)
}
