//! Hardware page-table contract.
//!
//! The core never touches page-table entries directly; it goes through
//! [`PageDirectory`], which the platform implements over the MMU.
//! [`SoftPageDir`] is a software implementation used by the host
//! harness and the tests, where "hardware" accessed/dirty bits are set
//! by the harness.

use alloc::collections::BTreeMap;

use spin::Mutex;

use super::{KPage, UPage};

pub trait PageDirectory: Send + Sync {
    /// Maps `upage` to `kpage`. Fails if `upage` is already mapped.
    fn install(&self, upage: UPage, kpage: KPage, writable: bool) -> bool;

    /// The frame mapped at `upage`, if any.
    fn lookup(&self, upage: UPage) -> Option<KPage>;

    /// Removes the mapping at `upage`.
    fn clear(&self, upage: UPage);

    fn is_accessed(&self, upage: UPage) -> bool;
    fn set_accessed(&self, upage: UPage, accessed: bool);
    fn is_dirty(&self, upage: UPage) -> bool;
    fn set_dirty(&self, upage: UPage, dirty: bool);
}

struct SoftPte {
    kpage: KPage,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Software page directory backed by a map.
#[derive(Default)]
pub struct SoftPageDir {
    entries: Mutex<BTreeMap<UPage, SoftPte>>,
}

impl SoftPageDir {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the mapping at `upage` is writable. Diagnostic.
    pub fn is_writable(&self, upage: UPage) -> Option<bool> {
        self.entries.lock().get(&upage).map(|pte| pte.writable)
    }

    /// Number of live mappings. Diagnostic.
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl PageDirectory for SoftPageDir {
    fn install(&self, upage: UPage, kpage: KPage, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            return false;
        }
        entries.insert(
            upage,
            SoftPte {
                kpage,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn lookup(&self, upage: UPage) -> Option<KPage> {
        self.entries.lock().get(&upage).map(|pte| pte.kpage)
    }

    fn clear(&self, upage: UPage) {
        self.entries.lock().remove(&upage);
    }

    fn is_accessed(&self, upage: UPage) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .is_some_and(|pte| pte.accessed)
    }

    fn set_accessed(&self, upage: UPage, accessed: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            pte.accessed = accessed;
        }
    }

    fn is_dirty(&self, upage: UPage) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .is_some_and(|pte| pte.dirty)
    }

    fn set_dirty(&self, upage: UPage, dirty: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            pte.dirty = dirty;
        }
    }
}
