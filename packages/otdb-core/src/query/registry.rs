use std::collections::HashMap;
use std::sync::OnceLock;

/// How a `$`-prefixed top-level key of a query is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperatorClass {
    /// Replaces the cursor entirely (`$distinct`, `$aggregate`, `$mapReduce`).
    CollectionOperation,
    /// Consumes the cursor and produces a non-document result (`$count`).
    CursorOperation,
    /// Modifies the cursor (`$sort`, `$limit`, ...).
    CursorTransform,
}

const COLLECTION_OPERATIONS: &[&str] = &["$distinct", "$aggregate", "$mapReduce"];

const CURSOR_OPERATIONS: &[&str] = &["$count", "$explain", "$map"];

const CURSOR_TRANSFORMS: &[&str] = &[
    "$batchSize",
    "$comment",
    "$hint",
    "$max",
    "$maxScan",
    "$maxTimeMS",
    "$min",
    "$noCursorTimeout",
    "$orderby",
    "$readConcern",
    "$readPref",
    "$returnKey",
    "$snapshot",
    "$sort",
    "$skip",
    "$limit",
    "$showDiskLoc",
    "$showRecordId",
];

/// Process-wide operator classification. Built on first use, read-only afterwards.
#[derive(Debug)]
pub struct OperatorRegistry {
    classes: HashMap<&'static str, OperatorClass>,
}

impl OperatorRegistry {
    pub fn global() -> &'static OperatorRegistry {
        static REGISTRY: OnceLock<OperatorRegistry> = OnceLock::new();
        REGISTRY.get_or_init(OperatorRegistry::build)
    }

    fn build() -> Self {
        let mut classes = HashMap::new();
        let tables = [
            (COLLECTION_OPERATIONS, OperatorClass::CollectionOperation),
            (CURSOR_OPERATIONS, OperatorClass::CursorOperation),
            (CURSOR_TRANSFORMS, OperatorClass::CursorTransform),
        ];
        for (names, class) in tables {
            for name in names {
                classes.insert(*name, class);
            }
        }
        Self { classes }
    }

    pub fn classify(&self, key: &str) -> Option<OperatorClass> {
        self.classes.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

pub fn classify(key: &str) -> Option<OperatorClass> {
    OperatorRegistry::global().classify(key)
}
