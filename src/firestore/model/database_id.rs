pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `projects/{project}/databases/{database}`
    pub fn canonical_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_database() {
        let db = DatabaseId::default("project");
        assert_eq!(db.project_id(), "project");
        assert_eq!(db.database(), DEFAULT_DATABASE_ID);
        assert_eq!(db.canonical_name(), "projects/project/databases/(default)");
    }
}
