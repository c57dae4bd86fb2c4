//! Property: authorize(C, R) is Allowed iff a grant row exists for (C, R),
//! R's bit is set on C, and C is enabled.

use model_access::*;
use proptest::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct ResourceCase {
    has_grant: bool,
    bit_set: bool,
}

fn resource_case() -> impl Strategy<Value = ResourceCase> {
    (any::<bool>(), any::<bool>())
        .prop_map(|(has_grant, bit_set)| ResourceCase { has_grant, bit_set })
}

/// Build the durable state through the public API only.
///
/// A bit without a grant row is produced the way it happens in production:
/// grant on a resource, then delete the resource and register a new one on
/// the same bit.
async fn provision(engine: &AccessEngine, cases: &[ResourceCase], enabled: bool) {
    engine.register_credential(Uuid::new_v4(), "abc").await.unwrap();
    let limits = RateLimits::new(60, 600).unwrap();

    for (bit, case) in (0u8..).zip(cases) {
        let name = format!("model-{bit}");

        if case.bit_set && !case.has_grant {
            let retired = engine.create_resource(&format!("retired-{bit}"), bit).await.unwrap();
            engine.grant("abc", &retired.name, limits).await.unwrap();
            engine.delete_resource(retired.id).await.unwrap();
        }

        engine.create_resource(&name, bit).await.unwrap();

        if case.has_grant {
            engine.grant("abc", &name, limits).await.unwrap();
            if !case.bit_set {
                engine.revoke("abc", &name).await.unwrap();
            }
        }
    }

    if !enabled {
        engine.disable_credential("abc").await.unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn authorize_allows_iff_grant_bit_and_enabled(
        cases in prop::collection::vec(resource_case(), 1..10),
        enabled in any::<bool>(),
        warm_cache in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        runtime.block_on(async {
            let engine = AccessEngine::new(
                Arc::new(InMemoryAccessStore::new()),
                Arc::new(InMemoryCacheStore::new()),
                &AccessConfig::default(),
            )
            .unwrap();
            provision(&engine, &cases, enabled).await;

            if !warm_cache {
                engine.invalidate_permissions("abc").await.unwrap();
            }

            for (bit, case) in (0u8..).zip(&cases) {
                let decision = engine.authorize("abc", &format!("model-{bit}")).await.unwrap();
                let expected = case.has_grant && case.bit_set && enabled;
                prop_assert_eq!(
                    decision.is_allowed(),
                    expected,
                    "case {:?} enabled {}",
                    case,
                    enabled
                );

                if !enabled {
                    prop_assert_eq!(decision, Decision::denied(DenyReason::DisabledCredential));
                }
            }
            Ok(())
        })?;
    }
}
