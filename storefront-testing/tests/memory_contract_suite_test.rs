use storefront_testing::store_contract_tests;

store_contract_tests!(suite = in_memory, make_store = storefront::InMemoryStore::new);

mod wrapped {
    use storefront::InMemoryStore;
    use storefront_testing::{store_contract_tests, FaultInjectingStore, FaultInjectionExt};

    pub(super) fn make_store() -> FaultInjectingStore<InMemoryStore> {
        InMemoryStore::new().with_faults()
    }

    // An unarmed wrapper must be indistinguishable from the store it wraps.
    store_contract_tests!(
        suite = unarmed_fault_injection,
        make_store = super::make_store
    );
}
