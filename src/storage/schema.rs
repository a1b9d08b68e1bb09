//! Database schema constants and SQL statements for the orchestrator's
//! tables.

/// `maintainer`: the package maintainer attached to a `Build`.
pub const CREATE_MAINTAINER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS maintainer (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    email VARCHAR(255) NOT NULL
)
"#;

/// `projectversion`: the target project/version pair a build belongs to.
pub const CREATE_PROJECTVERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS projectversion (
    id BIGSERIAL PRIMARY KEY,
    project_name VARCHAR(255) NOT NULL,
    version VARCHAR(255) NOT NULL,
    is_locked BOOLEAN NOT NULL DEFAULT FALSE
)
"#;

/// `sourcerepository`: a Git-hosted source repository and its lifecycle flag.
pub const CREATE_SOURCEREPOSITORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sourcerepository (
    id BIGSERIAL PRIMARY KEY,
    url TEXT NOT NULL,
    name VARCHAR(255),
    state VARCHAR(32) NOT NULL DEFAULT 'new'
)
"#;

/// `sourcerepository_projectversion`: which project versions a repository
/// is attached to.
pub const CREATE_SOURCEREPOSITORY_PROJECTVERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sourcerepository_projectversion (
    sourcerepository_id BIGINT NOT NULL REFERENCES sourcerepository(id) ON DELETE CASCADE,
    projectversion_id BIGINT NOT NULL REFERENCES projectversion(id) ON DELETE CASCADE,
    PRIMARY KEY (sourcerepository_id, projectversion_id)
)
"#;

/// `build`: the build→source→deb tree, one row per node.
pub const CREATE_BUILD_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS build (
    id BIGSERIAL PRIMARY KEY,
    parent_id BIGINT REFERENCES build(id) ON DELETE CASCADE,
    buildtype VARCHAR(16) NOT NULL,
    buildstate VARCHAR(32) NOT NULL,
    createdstamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    startstamp TIMESTAMPTZ,
    buildendstamp TIMESTAMPTZ,
    endstamp TIMESTAMPTZ,
    version VARCHAR(255),
    git_ref VARCHAR(255),
    ci_branch VARCHAR(255),
    sourcename VARCHAR(255),
    architecture VARCHAR(32),
    is_ci BOOLEAN NOT NULL DEFAULT FALSE,
    builddeps TEXT,
    sourcerepository_id BIGINT REFERENCES sourcerepository(id),
    projectversion_id BIGINT REFERENCES projectversion(id),
    maintainer_id BIGINT REFERENCES maintainer(id),
    buildtask_id BIGINT
)
"#;

/// `build_projectversion`: the project versions a `deb` build targets.
pub const CREATE_BUILD_PROJECTVERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS build_projectversion (
    build_id BIGINT NOT NULL REFERENCES build(id) ON DELETE CASCADE,
    projectversion_id BIGINT NOT NULL REFERENCES projectversion(id) ON DELETE CASCADE,
    PRIMARY KEY (build_id, projectversion_id)
)
"#;

/// `chroot`: a reusable build environment, keyed by its driving build.
pub const CREATE_CHROOT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS chroot (
    id BIGSERIAL PRIMARY KEY,
    build_id BIGINT NOT NULL REFERENCES build(id) ON DELETE CASCADE,
    architecture VARCHAR(32) NOT NULL,
    basemirror JSONB NOT NULL
)
"#;

/// `buildtask`: the dispatch record tying a `Build` to the node executing it.
pub const CREATE_BUILDTASK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS buildtask (
    id BIGSERIAL PRIMARY KEY,
    build_id BIGINT NOT NULL REFERENCES build(id) ON DELETE CASCADE,
    node_id VARCHAR(255) NOT NULL
)
"#;

/// `metadata`: generic key/value storage for orchestrator-wide settings
/// (e.g. the maintenance-mode flag the HTTP admin surface would toggle).
pub const CREATE_METADATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    key VARCHAR(255) PRIMARY KEY,
    value JSONB NOT NULL
)
"#;

pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_build_parent_id ON build(parent_id);
CREATE INDEX IF NOT EXISTS idx_build_buildstate ON build(buildstate);
CREATE INDEX IF NOT EXISTS idx_build_buildtype_buildstate ON build(buildtype, buildstate);
CREATE INDEX IF NOT EXISTS idx_sourcerepository_state ON sourcerepository(state)
"#;

/// Returns all schema creation statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_MAINTAINER_TABLE,
        CREATE_PROJECTVERSION_TABLE,
        CREATE_SOURCEREPOSITORY_TABLE,
        CREATE_SOURCEREPOSITORY_PROJECTVERSION_TABLE,
        CREATE_BUILD_TABLE,
        CREATE_BUILD_PROJECTVERSION_TABLE,
        CREATE_CHROOT_TABLE,
        CREATE_BUILDTASK_TABLE,
        CREATE_METADATA_TABLE,
        CREATE_INDEXES,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const MAINTAINER: &str = "maintainer";
    pub const PROJECTVERSION: &str = "projectversion";
    pub const SOURCEREPOSITORY: &str = "sourcerepository";
    pub const BUILD: &str = "build";
    pub const CHROOT: &str = "chroot";
    pub const BUILDTASK: &str = "buildtask";
    pub const METADATA: &str = "metadata";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_table_is_created_after_its_foreign_keys() {
        let statements = all_schema_statements();
        let build_idx = statements.iter().position(|s| s.contains("CREATE TABLE IF NOT EXISTS build ")).unwrap();
        let sourcerepo_idx = statements.iter().position(|s| s.contains("sourcerepository")).unwrap();
        assert!(sourcerepo_idx < build_idx);
    }

    #[test]
    fn table_constants_match_schema_names() {
        assert_eq!(tables::BUILD, "build");
        assert_eq!(tables::SOURCEREPOSITORY, "sourcerepository");
    }
}
