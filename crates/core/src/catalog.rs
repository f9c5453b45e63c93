//! The table catalog: every exported table, its primary key, and the foreign
//! keys that constrain restore order.
//!
//! Tables are declared as a graph and sorted once when the catalog is built.
//! The resulting order places each table after every table it references,
//! which the loader depends on: a dependent table filtered before its parent
//! would see no accepted keys and drop every row.

use std::collections::HashSet;

use thiserror::Error;

pub const PRIMARY_KEY: &str = "id";

/// Table whose `role` column goes through legacy role normalization.
pub const PROFILE_TABLE: &str = "profiles";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub parent: String,
    /// Rows whose value is not among the parent's accepted keys are dropped.
    pub enforced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub primary_key: String,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: PRIMARY_KEY.to_owned(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    /// Declares an ordering-only reference to `parent`.
    pub fn references(mut self, column: impl Into<String>, parent: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            parent: parent.into(),
            enforced: false,
        });
        self
    }

    /// Declares a reference whose dangling rows are filtered out on restore.
    pub fn requires(mut self, column: impl Into<String>, parent: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            parent: parent.into(),
            enforced: true,
        });
        self
    }

    pub fn depends_on(&self) -> impl Iterator<Item = &str> {
        self.foreign_keys.iter().map(|fk| fk.parent.as_str())
    }

    pub fn enforced_keys(&self) -> impl Iterator<Item = &ForeignKey> {
        self.foreign_keys.iter().filter(|fk| fk.enforced)
    }

    pub fn is_dependency_sensitive(&self) -> bool {
        self.foreign_keys.iter().any(|fk| fk.enforced)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("table `{0}` is declared more than once")]
    Duplicate(String),
    #[error("table `{table}` references undeclared table `{parent}`")]
    UnknownParent { table: String, parent: String },
    #[error("dependency cycle between tables: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Catalog {
    order: Vec<TableSpec>,
}

impl Catalog {
    /// Sorts `tables` so that parents precede dependents.
    ///
    /// Among tables whose dependencies are already placed, declaration order
    /// wins, so a list that is already sorted comes back unchanged.
    pub fn new(tables: Vec<TableSpec>) -> Result<Self, CatalogError> {
        let mut declared = HashSet::new();
        for table in &tables {
            if !declared.insert(table.name.as_str()) {
                return Err(CatalogError::Duplicate(table.name.clone()));
            }
        }
        for table in &tables {
            if let Some(parent) = table.depends_on().find(|p| !declared.contains(p)) {
                return Err(CatalogError::UnknownParent {
                    table: table.name.clone(),
                    parent: parent.to_owned(),
                });
            }
        }

        let mut pending = tables;
        let mut placed: HashSet<String> = HashSet::new();
        let mut order = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            let ready = pending
                .iter()
                .position(|t| t.depends_on().all(|p| placed.contains(p)));
            match ready {
                Some(idx) => {
                    let table = pending.remove(idx);
                    placed.insert(table.name.clone());
                    order.push(table);
                }
                None => {
                    return Err(CatalogError::Cycle(
                        pending.into_iter().map(|t| t.name).collect(),
                    ))
                }
            }
        }

        Ok(Self { order })
    }

    /// The dashboard's tables.
    pub fn shipped() -> Result<Self, CatalogError> {
        Self::new(vec![
            TableSpec::new(PROFILE_TABLE),
            TableSpec::new("skill_categories"),
            TableSpec::new("skills").references("category_id", "skill_categories"),
            TableSpec::new("projects").references("owner_id", PROFILE_TABLE),
            TableSpec::new("project_members")
                .references("project_id", "projects")
                .references("profile_id", PROFILE_TABLE),
            TableSpec::new("employee_ratings")
                .references("profile_id", PROFILE_TABLE)
                .references("skill_id", "skills"),
            TableSpec::new("rating_approvals")
                .requires("rating_id", "employee_ratings")
                .references("approver_id", PROFILE_TABLE),
            TableSpec::new("tickets").references("created_by", PROFILE_TABLE),
            TableSpec::new("ticket_comments")
                .references("ticket_id", "tickets")
                .references("author_id", PROFILE_TABLE),
            TableSpec::new("notifications").references("profile_id", PROFILE_TABLE),
        ])
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.order
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|t| t.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.order.iter().find(|t| t.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_parents_first(catalog: &Catalog) {
        for (idx, table) in catalog.tables().iter().enumerate() {
            for parent in table.depends_on() {
                let parent_idx = catalog.position(parent).expect("parent declared");
                assert!(
                    parent_idx < idx,
                    "{} must come after {}",
                    table.name,
                    parent
                );
            }
        }
    }

    #[test]
    fn shipped_catalog_is_acyclic_and_ordered() {
        let catalog = Catalog::shipped().expect("shipped catalog");
        assert_eq!(catalog.len(), 10);
        assert_parents_first(&catalog);
        assert!(catalog
            .get("rating_approvals")
            .expect("rating_approvals")
            .is_dependency_sensitive());
    }

    #[test]
    fn dependents_declared_first_are_moved_after_parents() {
        let catalog = Catalog::new(vec![
            TableSpec::new("comments").references("post_id", "posts"),
            TableSpec::new("posts").references("author_id", "users"),
            TableSpec::new("users"),
            TableSpec::new("tags"),
        ])
        .expect("catalog");

        let names: Vec<_> = catalog.names().collect();
        assert_eq!(names, vec!["users", "posts", "comments", "tags"]);
        assert_parents_first(&catalog);
    }

    #[test]
    fn sorted_input_keeps_declaration_order() {
        let catalog = Catalog::new(vec![
            TableSpec::new("a"),
            TableSpec::new("b").requires("a_id", "a"),
            TableSpec::new("c"),
        ])
        .expect("catalog");
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let err = Catalog::new(vec![
            TableSpec::new("a").references("b_id", "b"),
            TableSpec::new("b").references("a_id", "a"),
            TableSpec::new("c"),
        ])
        .unwrap_err();
        assert_eq!(err, CatalogError::Cycle(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn self_reference_counts_as_cycle() {
        let err = Catalog::new(vec![TableSpec::new("tree").references("parent_id", "tree")])
            .unwrap_err();
        assert!(matches!(err, CatalogError::Cycle(_)));
    }

    #[test]
    fn unknown_parent_and_duplicates_are_rejected() {
        let err = Catalog::new(vec![TableSpec::new("b").references("a_id", "a")]).unwrap_err();
        assert_eq!(
            err,
            CatalogError::UnknownParent {
                table: "b".into(),
                parent: "a".into()
            }
        );

        let err = Catalog::new(vec![TableSpec::new("a"), TableSpec::new("a")]).unwrap_err();
        assert_eq!(err, CatalogError::Duplicate("a".into()));
    }
}
