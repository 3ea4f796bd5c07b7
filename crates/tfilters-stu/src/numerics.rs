//! Small integer helpers shared by the convolution engines and the backbone.

/// Nearest power of two to `x`.
///
/// With `round_up` this is the smallest power of two `>= x`, otherwise the
/// largest power of two `<= x`. Zero maps to 1.
pub fn nearest_power_of_two(x: usize, round_up: bool) -> usize {
    if x <= 1 {
        return 1;
    }
    if round_up {
        x.next_power_of_two()
    } else {
        1 << (usize::BITS - 1 - x.leading_zeros())
    }
}

/// FFT length for a causal convolution over `seq_len` samples: the next
/// power of two that holds the full `2 * seq_len - 1` linear convolution.
pub fn padded_conv_len(seq_len: usize) -> usize {
    nearest_power_of_two((2 * seq_len).saturating_sub(1), true)
}
