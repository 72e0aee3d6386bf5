#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rank_pool::binarize::BitVector;
use rank_pool::simd;

#[derive(Arbitrary, Debug)]
struct BinarizeInput {
    vector: Vec<f32>,
    query: Vec<f32>,
    hex: String,
}

fuzz_target!(|input: BinarizeInput| {
    if let Ok(bits) = BitVector::from_floats(&input.vector) {
        let back = BitVector::from_hex(bits.dim(), &bits.to_hex()).expect("own hex decodes");
        assert_eq!(back.sign_pattern(), bits.sign_pattern());
        let _ = simd::maxsim_bits(&[input.query.as_slice()], &[bits.as_bytes()]);
    }

    // Arbitrary text must be rejected cleanly, never panic
    let _ = BitVector::from_hex(input.vector.len(), &input.hex);
});
