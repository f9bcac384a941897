use crate::type_alias::PdId;

/// Protection domain.
///
/// Only its identity matters to the event core: an endpoint gets a queue
/// pair once it is given a protection domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pd {
    id: PdId,
}

impl Pd {
    pub(crate) fn new(id: PdId) -> Self {
        Self { id }
    }

    #[inline]
    pub fn id(&self) -> PdId {
        self.id
    }
}
