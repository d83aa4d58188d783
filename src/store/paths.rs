//! Key layout for the KV tree and prefix layout for the object store.
//!
//! ```text
//! /pipelines/<id>                       pipeline record
//! /pipeline-map/<owner>:<repo>          pipeline id
//! /pipelines/<id>/builds/<n>            build record
//! /pipelines/<id>/builds/<n>/stages/<i> stage record
//! /users/<uuid>                         user record
//! /user-map/<provider>/<name>           user uuid
//! ```

pub const PIPELINES: &str = "/pipelines";
pub const PIPELINE_MAP: &str = "/pipeline-map";
pub const USERS: &str = "/users";
pub const USER_MAP: &str = "/user-map";

pub fn pipeline(id: &str) -> String {
    format!("{PIPELINES}/{id}")
}

pub fn pipeline_map(owner: &str, repo: &str) -> String {
    format!("{PIPELINE_MAP}/{owner}:{repo}")
}

pub fn builds_dir(pipeline_id: &str) -> String {
    format!("{PIPELINES}/{pipeline_id}/builds")
}

pub fn build(pipeline_id: &str, number: u64) -> String {
    format!("{PIPELINES}/{pipeline_id}/builds/{number}")
}

pub fn stages_dir(pipeline_id: &str, number: u64) -> String {
    format!("{PIPELINES}/{pipeline_id}/builds/{number}/stages")
}

pub fn stage(pipeline_id: &str, number: u64, index: u32) -> String {
    format!("{PIPELINES}/{pipeline_id}/builds/{number}/stages/{index}")
}

pub fn user(id: &str) -> String {
    format!("{USERS}/{id}")
}

pub fn user_map(provider: &str, name: &str) -> String {
    format!("{USER_MAP}/{provider}/{name}")
}

// Object-store prefixes (no leading slash; opendal paths are bucket-relative).

pub fn artifact_root(pipeline_id: &str) -> String {
    format!("pipelines/{pipeline_id}/")
}

pub fn stage_artifacts(pipeline_id: &str, number: u64, index: u32) -> String {
    format!("pipelines/{pipeline_id}/builds/{number}/stages/{index}/artifacts/")
}

pub fn stage_logs(pipeline_id: &str, number: u64, index: u32) -> String {
    format!("pipelines/{pipeline_id}/builds/{number}/stages/{index}/logs/")
}
