use std::any::Any;

use super::RunnerError;

/// Keeps the most recently loaded model alive between tasks.
///
/// Holds at most one value. Loading a different key drops the previous
/// model before the loader runs, so two models are never resident at once.
#[derive(Default)]
pub struct ModelCache {
    key: Option<String>,
    value: Option<Box<dyn Any + Send>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key of the currently cached model, if any.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Return the cached model for `key`, loading it with `loader` on a miss.
    pub fn load<T, F>(&mut self, key: &str, loader: F) -> Result<&mut T, RunnerError>
    where
        T: Any + Send,
        F: FnOnce() -> Result<T, RunnerError>,
    {
        let hit = self.key.as_deref() == Some(key)
            && self.value.as_ref().is_some_and(|v| v.is::<T>());
        if !hit {
            self.key = None;
            self.value = None;
            let value = loader()?;
            self.key = Some(key.to_string());
            self.value = Some(Box::new(value));
        }

        self.value
            .as_mut()
            .and_then(|v| v.downcast_mut::<T>())
            .ok_or_else(|| RunnerError::Task("model cache holds an unexpected type".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_reuses_loaded_value() {
        let mut cache = ModelCache::new();
        let mut loads = 0;

        for _ in 0..3 {
            let value = cache
                .load("gpt2", || {
                    loads += 1;
                    Ok(String::from("weights"))
                })
                .unwrap();
            assert_eq!(value, "weights");
        }
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_new_key_replaces_value() {
        let mut cache = ModelCache::new();
        cache.load("a", || Ok(1u32)).unwrap();
        *cache.load("b", || Ok(2u32)).unwrap() += 10;
        assert_eq!(cache.key(), Some("b"));
        assert_eq!(*cache.load("b", || Ok(0u32)).unwrap(), 12);
    }

    #[test]
    fn test_failed_load_leaves_cache_empty() {
        let mut cache = ModelCache::new();
        cache.load("a", || Ok(1u32)).unwrap();
        let err = cache.load::<u32, _>("b", || Err(RunnerError::Task("no weights".into())));
        assert!(err.is_err());
        assert!(cache.key().is_none());
    }
}
