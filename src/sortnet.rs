//! Comparator networks for the `sortN` operator.
//!
//! The JIT lowers `sortN` to a fixed sequence of compare-exchange pairs over
//! compile-time stack slots. The network is Batcher's odd-even merge
//! generated by the iterative procedure below; the emission order is part of
//! the routine fingerprint's stability, so the procedure is deterministic.

/// A comparator `(a, b)` orders slot `a` before slot `b`.
pub type SortingNetwork = Vec<(usize, usize)>;

/// Build the comparator network for `n` elements. `n = 0` and `n = 1`
/// produce the empty network.
pub fn build(n: usize) -> SortingNetwork {
    let mut net = SortingNetwork::new();
    if n < 2 {
        return net;
    }

    let n = n as isize;
    let mut t = 0u32;
    while n > (1 << t) {
        t += 1;
    }
    let mut p: isize = 1 << (t - 1);
    while p > 0 {
        let mut q: isize = 1 << (t - 1);
        let mut r: isize = 0;
        let mut d = p;
        while d > 0 {
            for i in 0..n - d {
                if i & p == r {
                    net.push((i as usize, (i + d) as usize));
                }
            }
            d = q - p;
            q >>= 1;
            r = p;
        }
        p >>= 1;
    }
    net
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(net: &SortingNetwork, data: &mut [f32]) {
        for &(a, b) in net {
            if data[a] > data[b] {
                data.swap(a, b);
            }
        }
    }

    #[test]
    fn sorts_all_permutations_of_5() {
        let net = build(5);
        // Exhaustive 0/1 check (the 0-1 principle) over all 2^5 inputs.
        for bits in 0..32u32 {
            let mut v: Vec<f32> = (0..5).map(|i| ((bits >> i) & 1) as f32).collect();
            apply(&net, &mut v);
            assert!(v.windows(2).all(|w| w[0] <= w[1]), "input {bits:05b}");
        }
    }

    #[test]
    fn sorts_power_of_two_and_odd_sizes() {
        for n in [2usize, 3, 4, 7, 8, 13, 16] {
            let net = build(n);
            for seed in 0..64u64 {
                let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let mut v: Vec<f32> = (0..n)
                    .map(|_| {
                        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                        (x >> 33) as f32
                    })
                    .collect();
                apply(&net, &mut v);
                assert!(v.windows(2).all(|w| w[0] <= w[1]), "n={n} seed={seed}");
            }
        }
    }

    #[test]
    fn empty_and_singleton() {
        assert!(build(0).is_empty());
        assert!(build(1).is_empty());
        assert_eq!(build(2), vec![(0, 1)]);
    }
}
