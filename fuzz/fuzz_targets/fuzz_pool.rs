#![no_main]

use libfuzzer_sys::fuzz_target;
use rank_pool::pool::{target_count, HierarchicalPooler, Pooler, SequentialPooler};

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }

    let mut offset = 0;
    let n_tokens = (data[offset] as usize % 48) + 1; // 1-48 tokens
    offset += 1;
    let dim = (data[offset] as usize % 64) + 1; // 1-64 dimensions
    offset += 1;
    let pool_factor = (data[offset] as usize % 6) + 1; // 1-6 pool factor
    offset += 1;

    let required_bytes = n_tokens * dim * 4;
    if data.len() < offset + required_bytes {
        return;
    }

    let mut tokens = Vec::with_capacity(n_tokens);
    for _ in 0..n_tokens {
        let mut token = Vec::with_capacity(dim);
        for _ in 0..dim {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[offset..offset + 4]);
            let val = f32::from_le_bytes(raw);
            if !val.is_finite() {
                return;
            }
            token.push(val);
            offset += 4;
        }
        tokens.push(token);
    }

    let expected = target_count(n_tokens, pool_factor);
    let ward = HierarchicalPooler.pool_by_factor(&tokens, pool_factor);
    assert_eq!(ward.len(), expected);
    assert!(ward.iter().all(|v| v.len() == dim));

    // fixed windows may leave fewer groups than the target
    let windows = SequentialPooler.pool_by_factor(&tokens, pool_factor);
    assert!(!windows.is_empty() && windows.len() <= expected);
    assert!(windows.iter().all(|v| v.len() == dim));
});
