//! kview ownership: rules, tree construction and root finding

#![forbid(unsafe_code)]

pub mod defaults;
pub mod roots;
pub mod rules;
pub mod selector;
pub mod source;
pub mod tree;

pub use defaults::{default_rules, DEFAULT_STATE_EXPRESSION};
pub use roots::{RootFinder, ViewIndex};
pub use rules::{BuiltinRelationship, FieldPath, OwnedResource, OwnershipCriteria, OwnershipRule, OwnershipRules, ValidationType};
pub use selector::{materialize, owns, SecondaryQuery};
pub use source::RevisionSource;
pub use tree::{objects_from_tree, BuiltTree, TreeBuilder, TreeConfig};
