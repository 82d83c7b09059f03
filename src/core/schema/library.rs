use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::schema::{ExtentType, INDEX_TYPE_NAME, RESERVED_PREFIX, TYPE_DEFINITION_NAME};
use crate::core::{Error, Result};

/// Named set of extent types, as written at the start of a file.
#[derive(Debug, Clone, Default)]
pub struct ExtentTypeLibrary {
    by_name: BTreeMap<String, Arc<ExtentType>>,
}

impl ExtentTypeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a description. Registering the same description again
    /// returns the existing shared type; a different description under an
    /// existing name is rejected.
    pub fn register_type(&mut self, description: &str) -> Result<Arc<ExtentType>> {
        let ty = ExtentType::from_description(description)?;
        self.register(ty)
    }

    pub fn register(&mut self, ty: Arc<ExtentType>) -> Result<Arc<ExtentType>> {
        if ty.is_reserved() {
            return Err(Error::type_mismatch(format!(
                "type name '{}' uses the reserved prefix {RESERVED_PREFIX}",
                ty.name()
            )));
        }
        if let Some(existing) = self.by_name.get(ty.name()) {
            if Arc::ptr_eq(existing, &ty) {
                return Ok(Arc::clone(existing));
            }
            return Err(Error::type_mismatch(format!(
                "conflicting definitions for type '{}'",
                ty.name()
            )));
        }
        self.by_name.insert(ty.name().to_string(), Arc::clone(&ty));
        Ok(ty)
    }

    pub fn register_types<'a, I>(&mut self, descriptions: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for description in descriptions {
            self.register_type(description)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Types in name order.
    pub fn types(&self) -> impl Iterator<Item = &Arc<ExtentType>> {
        self.by_name.values()
    }

    pub fn contains(&self, ty: &Arc<ExtentType>) -> bool {
        self.by_name
            .get(ty.name())
            .map(|existing| Arc::ptr_eq(existing, ty))
            .unwrap_or(false)
    }

    /// Exact lookup. The container's own types are always known.
    pub fn get_type_by_name(&self, name: &str) -> Option<Arc<ExtentType>> {
        match name {
            TYPE_DEFINITION_NAME => Some(ExtentType::type_definition()),
            INDEX_TYPE_NAME => Some(ExtentType::index_type()),
            _ => self.by_name.get(name).cloned(),
        }
    }

    pub fn require_type(&self, name: &str) -> Result<Arc<ExtentType>> {
        self.get_type_by_name(name)
            .ok_or_else(|| Error::type_mismatch(format!("unregistered type '{name}'")))
    }

    pub fn get_type_by_prefix(&self, prefix: &str) -> Result<Option<Arc<ExtentType>>> {
        self.unique_match(&format!("prefix '{prefix}'"), |name| name.starts_with(prefix))
    }

    pub fn get_type_by_substring(&self, needle: &str) -> Result<Option<Arc<ExtentType>>> {
        self.unique_match(&format!("substring '{needle}'"), |name| name.contains(needle))
    }

    /// Resolve a user pattern: `*` is the single non-reserved type,
    /// otherwise an exact name, then a unique prefix, then a unique substring.
    pub fn get_type_match(&self, pattern: &str) -> Result<Arc<ExtentType>> {
        if pattern == "*" {
            return self
                .unique_match("'*'", |name| !name.starts_with(RESERVED_PREFIX))?
                .ok_or_else(|| Error::type_mismatch("no type matches '*'"));
        }
        if let Some(ty) = self.get_type_by_name(pattern) {
            return Ok(ty);
        }
        if let Some(ty) = self.get_type_by_prefix(pattern)? {
            return Ok(ty);
        }
        self.get_type_by_substring(pattern)?
            .ok_or_else(|| Error::type_mismatch(format!("no type matches '{pattern}'")))
    }

    /// Look up `name` and check it satisfies a `major.minor` requirement.
    pub fn require_version(&self, name: &str, major: u32, minor: u32) -> Result<Arc<ExtentType>> {
        let ty = self.require_type(name)?;
        if !ty.is_compatible(major, minor) {
            return Err(Error::type_mismatch(format!(
                "type '{name}' is version {}.{}, need {major}.{minor} compatible",
                ty.major_version(),
                ty.minor_version()
            )));
        }
        Ok(ty)
    }

    fn unique_match<F>(&self, what: &str, mut pred: F) -> Result<Option<Arc<ExtentType>>>
    where
        F: FnMut(&str) -> bool,
    {
        let mut found: Option<&Arc<ExtentType>> = None;
        for (name, ty) in &self.by_name {
            if !pred(name) {
                continue;
            }
            if let Some(prev) = found {
                return Err(Error::type_mismatch(format!(
                    "{what} is ambiguous: '{}' and '{name}'",
                    prev.name()
                )));
            }
            found = Some(ty);
        }
        Ok(found.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(name: &str, version: &str) -> String {
        format!(
            r#"{{"name": "{name}", "namespace": "test.extentstore", "version": "{version}",
                "fields": [{{"name": "v", "type": "int32"}}]}}"#
        )
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut library = ExtentTypeLibrary::new();
        let a = library.register_type(&describe("Lib::A", "1.0")).expect("register");
        let b = library.register_type(&describe("Lib::A", "1.0")).expect("register");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(library.len(), 1);
        assert!(library.contains(&a));
        let conflict = library.register_type(&describe("Lib::A", "1.1"));
        assert!(matches!(conflict, Err(Error::TypeMismatch(_))));
    }

    #[test]
    fn test_prefix_and_substring_lookup() {
        let mut library = ExtentTypeLibrary::new();
        library
            .register_types([
                describe("NFS::Common", "1.0").as_str(),
                describe("NFS::Attr", "1.0").as_str(),
                describe("Trace::Block", "2.1").as_str(),
            ])
            .expect("register");

        let found = library.get_type_by_prefix("Trace").expect("prefix").expect("found");
        assert_eq!(found.name(), "Trace::Block");
        assert!(library.get_type_by_prefix("NFS::").is_err());
        assert!(library.get_type_by_prefix("Zed").expect("prefix").is_none());
        let found = library.get_type_by_substring("Attr").expect("substr").expect("found");
        assert_eq!(found.name(), "NFS::Attr");
        assert_eq!(library.get_type_match("Block").expect("match").name(), "Trace::Block");
        assert_eq!(library.get_type_match("NFS::Common").expect("match").name(), "NFS::Common");
        assert!(library.get_type_match("*").is_err());
        assert!(library.get_type_match("missing").is_err());
    }

    #[test]
    fn test_star_matches_single_user_type() {
        let mut library = ExtentTypeLibrary::new();
        library.register_type(&describe("Only::One", "1.0")).expect("register");
        assert!(matches!(
            library.register(ExtentType::index_type()),
            Err(Error::TypeMismatch(_))
        ));
        let reserved =
            r#"{"name": "ExtentStore::Mine", "fields": [{"name": "v", "type": "int32"}]}"#;
        assert!(library.register_type(reserved).is_err());
        assert_eq!(library.get_type_match("*").expect("star").name(), "Only::One");
    }

    #[test]
    fn test_require_version() {
        let mut library = ExtentTypeLibrary::new();
        library.register_type(&describe("Ver::T", "1.3")).expect("register");
        assert!(library.require_version("Ver::T", 1, 2).is_ok());
        assert!(matches!(library.require_version("Ver::T", 2, 0), Err(Error::TypeMismatch(_))));
        assert!(library.require_version("Ver::T", 1, 4).is_err());
        assert!(library.require_type("Nope").is_err());
        assert!(library.get_type_by_name(TYPE_DEFINITION_NAME).is_some());
    }
}
