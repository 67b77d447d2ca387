pub(crate) mod binned;
pub(crate) mod deferred;
pub(crate) mod free_list;
pub(crate) mod indirect;
pub(crate) mod malloc;
pub(crate) mod os_cache;
pub(crate) mod pool;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
