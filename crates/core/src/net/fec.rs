use super::shard::{ShardInfo, ShardLayout};

/// Primitive polynomial x^8 + x^4 + x^3 + x^2 + 1.
const GF_POLY: u16 = 0x11D;

/// Parity row `p` uses `alpha = p + 2`, so at most 254 distinct rows exist.
pub const MAX_RS_PARITY: usize = 253;

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

const fn build_tables() -> GfTables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= GF_POLY;
        }
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    GfTables { exp, log }
}

static GF: GfTables = build_tables();

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    GF.exp[GF.log[a as usize] as usize + GF.log[b as usize] as usize]
}

fn gf_inv(a: u8) -> Option<u8> {
    if a == 0 {
        return None;
    }
    Some(GF.exp[255 - GF.log[a as usize] as usize])
}

fn gf_pow(base: u8, exp: usize) -> u8 {
    if exp == 0 {
        return 1;
    }
    if base == 0 {
        return 0;
    }
    GF.exp[(GF.log[base as usize] as usize * exp) % 255]
}

fn parity_alpha(parity_index: usize) -> u8 {
    (parity_index + 2) as u8
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FecError {
    #[error("no data shards are missing")]
    NothingToRecover,
    #[error("{missing} data shards missing, parity covers {parity}")]
    TooManyMissing { missing: usize, parity: usize },
    #[error("{missing} data shards missing, only {available} parity shards received")]
    InsufficientParity { missing: usize, available: usize },
    #[error("recovery matrix is singular")]
    Singular,
}

/// Erasure code over data shards. Shards come back unframed; `ShardInfo::encode`
/// adds the wire header.
pub trait FecCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn max_parity(&self) -> usize;

    /// Splits `payload` into `ceil(len / shard_size)` data shards followed by `parity`
    /// parity shards. An empty payload yields no shards.
    fn build_shards(&self, payload: &[u8], shard_size: usize, parity: usize) -> Vec<ShardInfo>;

    /// Rebuilds the missing data shards of `layout` from the surviving ones.
    fn try_recover(
        &self,
        shards: &[Option<ShardInfo>],
        layout: &ShardLayout,
    ) -> Result<Vec<ShardInfo>, FecError>;
}

fn split_data(payload: &[u8], shard_size: usize, parity: usize) -> (Vec<ShardInfo>, usize) {
    let shard_size = shard_size.max(1);
    let data_shards = payload.len().div_ceil(shard_size);
    let total = (data_shards + parity) as u16;
    let pad_size = shard_size.min(payload.len());

    let shards = payload
        .chunks(shard_size)
        .enumerate()
        .map(|(index, chunk)| ShardInfo {
            total,
            index: index as u16,
            data_length: chunk.len() as u32,
            data: chunk.to_vec(),
        })
        .collect();
    (shards, pad_size)
}

fn padded(shard: &ShardInfo, pad_size: usize) -> Vec<u8> {
    let mut row = vec![0u8; pad_size];
    let len = shard.data_len().min(shard.data.len()).min(pad_size);
    row[..len].copy_from_slice(&shard.data[..len]);
    row
}

fn missing_or_done(
    shards: &[Option<ShardInfo>],
    layout: &ShardLayout,
) -> Result<Vec<usize>, FecError> {
    let missing = layout.missing_data(shards);
    if missing.is_empty() {
        return Err(FecError::NothingToRecover);
    }
    if missing.len() > layout.parity_shards {
        return Err(FecError::TooManyMissing {
            missing: missing.len(),
            parity: layout.parity_shards,
        });
    }
    Ok(missing)
}

fn recovered_shard(
    layout: &ShardLayout,
    index: usize,
    total: usize,
    mut row: Vec<u8>,
) -> ShardInfo {
    let len = layout.recovered_len(index);
    row.truncate(len);
    ShardInfo {
        total: total as u16,
        index: index as u16,
        data_length: len as u32,
        data: row,
    }
}

/// Reed–Solomon style parity over GF(2^8): parity row `p` is
/// `sum_j (p + 2)^j * data_j`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReedSolomon;

impl FecCodec for ReedSolomon {
    fn name(&self) -> &'static str {
        "reed-solomon"
    }

    fn max_parity(&self) -> usize {
        MAX_RS_PARITY
    }

    fn build_shards(&self, payload: &[u8], shard_size: usize, parity: usize) -> Vec<ShardInfo> {
        if payload.is_empty() {
            return Vec::new();
        }
        let parity = parity.min(MAX_RS_PARITY);
        let (mut shards, pad_size) = split_data(payload, shard_size, parity);
        let data_shards = shards.len();
        let total = (data_shards + parity) as u16;

        for p in 0..parity {
            let alpha = parity_alpha(p);
            let mut row = vec![0u8; pad_size];
            for (j, shard) in shards.iter().take(data_shards).enumerate() {
                let coef = gf_pow(alpha, j);
                for (acc, byte) in row.iter_mut().zip(&shard.data) {
                    *acc ^= gf_mul(coef, *byte);
                }
            }
            shards.push(ShardInfo {
                total,
                index: (data_shards + p) as u16,
                data_length: pad_size as u32,
                data: row,
            });
        }
        shards
    }

    fn try_recover(
        &self,
        shards: &[Option<ShardInfo>],
        layout: &ShardLayout,
    ) -> Result<Vec<ShardInfo>, FecError> {
        let missing = missing_or_done(shards, layout)?;
        let m = missing.len();
        let pad = layout.pad_size;
        let total = layout.data_shards + layout.parity_shards;

        let parity_rows: Vec<(usize, &ShardInfo)> = (layout.data_shards..total)
            .filter_map(|i| shards.get(i).and_then(Option::as_ref).map(|s| (i, s)))
            .take(m)
            .collect();
        if parity_rows.len() < m {
            return Err(FecError::InsufficientParity {
                missing: m,
                available: parity_rows.len(),
            });
        }

        let known: Vec<(usize, Vec<u8>)> = (0..layout.data_shards)
            .filter_map(|j| {
                shards
                    .get(j)
                    .and_then(Option::as_ref)
                    .map(|s| (j, padded(s, pad)))
            })
            .collect();

        let mut matrix = vec![vec![0u8; m]; m];
        let mut rhs = Vec::with_capacity(m);
        for (r, (shard_index, parity)) in parity_rows.iter().enumerate() {
            let alpha = parity_alpha(shard_index - layout.data_shards);
            for (c, missing_index) in missing.iter().enumerate() {
                matrix[r][c] = gf_pow(alpha, *missing_index);
            }

            let mut row = padded(parity, pad);
            for (j, data) in &known {
                let coef = gf_pow(alpha, *j);
                for (acc, byte) in row.iter_mut().zip(data) {
                    *acc ^= gf_mul(coef, *byte);
                }
            }
            rhs.push(row);
        }

        let inverse = invert(matrix).ok_or(FecError::Singular)?;

        let recovered = missing
            .iter()
            .enumerate()
            .map(|(c, index)| {
                let mut row = vec![0u8; pad];
                for (r, source) in rhs.iter().enumerate() {
                    let coef = inverse[c][r];
                    for (acc, byte) in row.iter_mut().zip(source) {
                        *acc ^= gf_mul(coef, *byte);
                    }
                }
                recovered_shard(layout, *index, total, row)
            })
            .collect();
        Ok(recovered)
    }
}

/// Gauss–Jordan inversion over GF(2^8).
fn invert(mut matrix: Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
    let n = matrix.len();
    let mut inverse: Vec<Vec<u8>> = (0..n)
        .map(|i| (0..n).map(|j| u8::from(i == j)).collect())
        .collect();

    for col in 0..n {
        let pivot = (col..n).find(|r| matrix[*r][col] != 0)?;
        matrix.swap(col, pivot);
        inverse.swap(col, pivot);

        let inv = gf_inv(matrix[col][col])?;
        for j in 0..n {
            matrix[col][j] = gf_mul(matrix[col][j], inv);
            inverse[col][j] = gf_mul(inverse[col][j], inv);
        }

        for row in 0..n {
            if row == col || matrix[row][col] == 0 {
                continue;
            }
            let factor = matrix[row][col];
            for j in 0..n {
                let m = gf_mul(factor, matrix[col][j]);
                let i = gf_mul(factor, inverse[col][j]);
                matrix[row][j] ^= m;
                inverse[row][j] ^= i;
            }
        }
    }
    Some(inverse)
}

/// Single XOR parity shard. Recovers one missing data shard; extra parity requests
/// are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct XorParity;

impl FecCodec for XorParity {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn max_parity(&self) -> usize {
        1
    }

    fn build_shards(&self, payload: &[u8], shard_size: usize, parity: usize) -> Vec<ShardInfo> {
        if payload.is_empty() {
            return Vec::new();
        }
        let parity = parity.min(1);
        let (mut shards, pad_size) = split_data(payload, shard_size, parity);
        if parity == 1 {
            let mut row = vec![0u8; pad_size];
            for shard in &shards {
                for (acc, byte) in row.iter_mut().zip(&shard.data) {
                    *acc ^= *byte;
                }
            }
            let data_shards = shards.len();
            shards.push(ShardInfo {
                total: (data_shards + 1) as u16,
                index: data_shards as u16,
                data_length: pad_size as u32,
                data: row,
            });
        }
        shards
    }

    fn try_recover(
        &self,
        shards: &[Option<ShardInfo>],
        layout: &ShardLayout,
    ) -> Result<Vec<ShardInfo>, FecError> {
        let missing = missing_or_done(shards, layout)?;
        if missing.len() > 1 {
            return Err(FecError::TooManyMissing {
                missing: missing.len(),
                parity: 1,
            });
        }
        let parity = shards
            .get(layout.data_shards)
            .and_then(Option::as_ref)
            .ok_or(FecError::InsufficientParity {
                missing: 1,
                available: 0,
            })?;

        let mut row = padded(parity, layout.pad_size);
        for shard in shards.iter().take(layout.data_shards).flatten() {
            for (acc, byte) in row.iter_mut().zip(&padded(shard, layout.pad_size)) {
                *acc ^= *byte;
            }
        }
        let total = layout.data_shards + layout.parity_shards;
        Ok(vec![recovered_shard(layout, missing[0], total, row)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::shard::reassemble;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    fn layout_for(payload_len: usize, shards: &[ShardInfo]) -> ShardLayout {
        let slots: Vec<Option<ShardInfo>> = shards.iter().cloned().map(Some).collect();
        ShardLayout::infer(shards.len(), payload_len, &slots).unwrap()
    }

    fn recover_with(
        codec: &dyn FecCodec,
        data: &[u8],
        shard_size: usize,
        parity: usize,
        drop: &[usize],
    ) -> Result<Vec<u8>, FecError> {
        let shards = codec.build_shards(data, shard_size, parity);
        let layout = layout_for(data.len(), &shards);
        let mut slots: Vec<Option<ShardInfo>> = shards.into_iter().map(Some).collect();
        for index in drop {
            slots[*index] = None;
        }
        for shard in codec.try_recover(&slots, &layout)? {
            let index = shard.index as usize;
            slots[index] = Some(shard);
        }
        Ok(reassemble(&slots, layout.data_shards).unwrap())
    }

    #[test]
    fn gf_tables_are_consistent() {
        for a in 1..=255u8 {
            let inv = gf_inv(a).unwrap();
            assert_eq!(gf_mul(a, inv), 1);
        }
        assert_eq!(gf_mul(0x80, 2), (0x100u16 ^ GF_POLY) as u8);
        assert_eq!(gf_pow(2, 8), 0x1D);
    }

    #[test]
    fn builds_data_then_parity() {
        let data = payload(2500);
        let shards = ReedSolomon.build_shards(&data, 1024, 2);
        assert_eq!(shards.len(), 5);
        assert_eq!(shards[2].data_length, 452);
        assert!(shards.iter().all(|s| s.total == 5));
        assert_eq!(shards[3].data_length, 1024);
        assert_eq!(shards[4].index, 4);
    }

    #[test]
    fn empty_payload_has_no_shards() {
        assert!(ReedSolomon.build_shards(&[], 1024, 1).is_empty());
        assert!(XorParity.build_shards(&[], 1024, 1).is_empty());
    }

    #[test]
    fn recovers_single_missing_data_shard() {
        let data = payload(900);
        let rebuilt = recover_with(&ReedSolomon, &data, 256, 1, &[2]).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn recovers_truncated_last_shard() {
        let data = payload(900);
        // last data shard is index 3 with 132 bytes
        let rebuilt = recover_with(&ReedSolomon, &data, 256, 1, &[3]).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn recovers_up_to_parity_count() {
        let data = payload(3000);
        let rebuilt = recover_with(&ReedSolomon, &data, 500, 3, &[0, 2, 5]).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn one_more_than_parity_fails() {
        let data = payload(3000);
        let err = recover_with(&ReedSolomon, &data, 500, 2, &[0, 1, 2]).unwrap_err();
        assert_eq!(
            err,
            FecError::TooManyMissing {
                missing: 3,
                parity: 2
            }
        );
    }

    #[test]
    fn missing_parity_only_is_nothing_to_do() {
        let data = payload(700);
        let shards = ReedSolomon.build_shards(&data, 256, 1);
        let layout = layout_for(data.len(), &shards);
        let mut slots: Vec<Option<ShardInfo>> = shards.into_iter().map(Some).collect();
        slots[3] = None;
        assert_eq!(
            ReedSolomon.try_recover(&slots, &layout),
            Err(FecError::NothingToRecover)
        );
        assert_eq!(reassemble(&slots, layout.data_shards).unwrap(), data);
    }

    #[test]
    fn uses_surviving_parity_row_by_index() {
        let data = payload(1000);
        // parity 0 lost together with one data shard: parity 1 must be used with its own alpha
        let rebuilt = recover_with(&ReedSolomon, &data, 250, 2, &[1, 4]).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn insufficient_parity_received() {
        let data = payload(1000);
        let err = recover_with(&ReedSolomon, &data, 250, 2, &[0, 1, 4]).unwrap_err();
        assert_eq!(
            err,
            FecError::InsufficientParity {
                missing: 2,
                available: 1
            }
        );
    }

    #[test]
    fn xor_parity_recovers_one() {
        let data = payload(777);
        let rebuilt = recover_with(&XorParity, &data, 200, 1, &[3]).unwrap();
        assert_eq!(rebuilt, data);
        assert!(matches!(
            recover_with(&XorParity, &data, 200, 1, &[0, 1]),
            Err(FecError::TooManyMissing { .. })
        ));
    }

    #[test]
    fn single_shard_payload() {
        let data = payload(40);
        let rebuilt = recover_with(&ReedSolomon, &data, 1024, 1, &[0]).unwrap();
        assert_eq!(rebuilt, data);
    }
}
