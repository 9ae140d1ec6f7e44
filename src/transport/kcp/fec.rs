//! Reed-Solomon forward error correction for KCP datagrams
//!
//! Every outgoing KCP packet becomes one data shard; after `data_shards`
//! of them, `parity_shards` parity packets are emitted so the receiver
//! can reconstruct any missing data shards of the group from any
//! `data_shards` shards received.
//!
//! Shard wire format:
//!
//! ```text
//! u32be seq    group-aligned shard sequence number
//! u16be flag   0xf1 data / 0xf2 parity
//! data shards:   u16be len || kcp packet (zero-padded inside parity math)
//! parity shards: parity bytes over the padded data shards
//! ```

use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::HashMap;

const FLAG_DATA: u16 = 0xf1;
const FLAG_PARITY: u16 = 0xf2;

/// Shard header: seq + flag
const HEADER_LEN: usize = 6;

/// Groups kept for reconstruction before eviction
const MAX_GROUPS: usize = 64;

/// Encodes outgoing packets into data + parity shards
pub(crate) struct FecEncoder {
    data_shards: usize,
    parity_shards: usize,
    codec: Option<ReedSolomon>,
    next_seq: u32,
    /// Len-prefixed payloads of the current group
    group: Vec<Vec<u8>>,
}

impl FecEncoder {
    /// `parity_shards == 0` disables FEC (packets still carry headers so
    /// both sides agree on framing)
    pub(crate) fn new(data_shards: usize, parity_shards: usize) -> Result<Self, String> {
        let codec = if parity_shards > 0 {
            Some(
                ReedSolomon::new(data_shards, parity_shards)
                    .map_err(|e| format!("bad FEC shard counts: {e}"))?,
            )
        } else {
            None
        };
        Ok(Self {
            data_shards,
            parity_shards,
            codec,
            next_seq: 0,
            group: Vec::with_capacity(data_shards),
        })
    }

    fn shard_total(&self) -> u32 {
        (self.data_shards + self.parity_shards) as u32
    }

    /// Encode one packet, returning the wire shards to transmit (the data
    /// shard itself, plus the group's parity shards when it completes)
    pub(crate) fn encode(&mut self, packet: &[u8]) -> Vec<Vec<u8>> {
        let mut payload = Vec::with_capacity(2 + packet.len());
        payload.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        payload.extend_from_slice(packet);

        let mut out = Vec::with_capacity(1 + self.parity_shards);
        out.push(make_shard(self.next_seq, FLAG_DATA, &payload));
        self.next_seq = self.next_seq.wrapping_add(1);

        let Some(codec) = &self.codec else {
            return out;
        };

        self.group.push(payload);
        if self.group.len() < self.data_shards {
            return out;
        }

        // Group complete: pad to the longest payload and compute parity
        let max_len = self.group.iter().map(Vec::len).max().unwrap_or(0);
        let mut shards: Vec<Vec<u8>> = self
            .group
            .drain(..)
            .map(|mut p| {
                p.resize(max_len, 0);
                p
            })
            .collect();
        shards.resize(self.data_shards + self.parity_shards, vec![0u8; max_len]);

        // Shard counts and sizes are validated at construction
        if codec.encode(&mut shards).is_ok() {
            for parity in &shards[self.data_shards..] {
                out.push(make_shard(self.next_seq, FLAG_PARITY, parity));
                self.next_seq = self.next_seq.wrapping_add(1);
            }
        } else {
            self.next_seq = self.next_seq.wrapping_add(self.parity_shards as u32);
        }

        debug_assert_eq!(self.next_seq % self.shard_total(), 0);
        out
    }
}

fn make_shard(seq: u32, flag: u16, payload: &[u8]) -> Vec<u8> {
    let mut shard = Vec::with_capacity(HEADER_LEN + payload.len());
    shard.extend_from_slice(&seq.to_be_bytes());
    shard.extend_from_slice(&flag.to_be_bytes());
    shard.extend_from_slice(payload);
    shard
}

struct Group {
    shards: Vec<Option<Vec<u8>>>,
    data_received: usize,
}

/// Decodes incoming shards, reconstructing lost data packets
pub(crate) struct FecDecoder {
    data_shards: usize,
    parity_shards: usize,
    codec: Option<ReedSolomon>,
    groups: HashMap<u32, Group>,
}

impl FecDecoder {
    pub(crate) fn new(data_shards: usize, parity_shards: usize) -> Result<Self, String> {
        let codec = if parity_shards > 0 {
            Some(
                ReedSolomon::new(data_shards, parity_shards)
                    .map_err(|e| format!("bad FEC shard counts: {e}"))?,
            )
        } else {
            None
        };
        Ok(Self {
            data_shards,
            parity_shards,
            codec,
            groups: HashMap::new(),
        })
    }

    /// Feed one received shard; returns the KCP packets it yields: the
    /// carried packet for a data shard, plus any packets recovered when a
    /// group becomes reconstructable
    pub(crate) fn decode(&mut self, wire: &[u8]) -> Vec<Vec<u8>> {
        if wire.len() < HEADER_LEN {
            return Vec::new();
        }
        let seq = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]);
        let flag = u16::from_be_bytes([wire[4], wire[5]]);
        let payload = &wire[HEADER_LEN..];

        let mut out = Vec::new();
        if flag == FLAG_DATA {
            if let Some(packet) = parse_data_payload(payload) {
                out.push(packet);
            }
        } else if flag != FLAG_PARITY {
            return out;
        }

        let Some(codec) = &self.codec else {
            return out;
        };

        let shard_total = (self.data_shards + self.parity_shards) as u32;
        let base = seq - seq % shard_total;
        let index = (seq % shard_total) as usize;

        let group = self.groups.entry(base).or_insert_with(|| Group {
            shards: vec![None; shard_total as usize],
            data_received: 0,
        });
        if group.shards[index].is_none() {
            group.shards[index] = Some(payload.to_vec());
            if index < self.data_shards {
                group.data_received += 1;
            }
        }

        // All data arrived on its own: nothing left to recover
        if group.data_received == self.data_shards {
            self.groups.remove(&base);
            self.evict();
            return out;
        }

        let received = group.shards.iter().filter(|s| s.is_some()).count();
        if received < self.data_shards {
            self.evict();
            return out;
        }

        // Enough shards: pad to the parity length and reconstruct
        let shard_len = group.shards[self.data_shards..]
            .iter()
            .flatten()
            .map(Vec::len)
            .max()
            .unwrap_or(0);
        if shard_len == 0 {
            self.evict();
            return out;
        }

        let Some(mut group) = self.groups.remove(&base) else {
            return out;
        };
        let missing: Vec<usize> = (0..self.data_shards)
            .filter(|&i| group.shards[i].is_none())
            .collect();
        for shard in group.shards.iter_mut().flatten() {
            shard.resize(shard_len, 0);
        }

        if codec.reconstruct(&mut group.shards).is_ok() {
            for i in missing {
                if let Some(packet) = group.shards[i]
                    .as_deref()
                    .and_then(parse_data_payload)
                {
                    out.push(packet);
                }
            }
        }

        self.evict();
        out
    }

    fn evict(&mut self) {
        while self.groups.len() > MAX_GROUPS {
            if let Some(&oldest) = self.groups.keys().min() {
                self.groups.remove(&oldest);
            }
        }
    }
}

fn parse_data_payload(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + len {
        return None;
    }
    Some(payload[2..2 + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_without_parity() {
        let mut enc = FecEncoder::new(10, 0).unwrap();
        let mut dec = FecDecoder::new(10, 0).unwrap();

        for i in 0..25u8 {
            let packet = vec![i; 10 + i as usize];
            let shards = enc.encode(&packet);
            assert_eq!(shards.len(), 1);
            let got = dec.decode(&shards[0]);
            assert_eq!(got, vec![packet]);
        }
    }

    #[test]
    fn test_parity_emitted_per_group() {
        let mut enc = FecEncoder::new(4, 2).unwrap();
        let mut total = Vec::new();
        for i in 0..4u8 {
            total.extend(enc.encode(&[i; 8]));
        }
        // 4 data shards + 2 parity shards
        assert_eq!(total.len(), 6);
    }

    #[test]
    fn test_lossless_delivery() {
        let mut enc = FecEncoder::new(4, 2).unwrap();
        let mut dec = FecDecoder::new(4, 2).unwrap();

        let packets: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 20 + i as usize]).collect();
        let mut delivered = Vec::new();
        for packet in &packets {
            for shard in enc.encode(packet) {
                delivered.extend(dec.decode(&shard));
            }
        }
        assert_eq!(delivered, packets);
    }

    #[test]
    fn test_recovers_lost_data_shard() {
        let mut enc = FecEncoder::new(4, 2).unwrap();
        let mut dec = FecDecoder::new(4, 2).unwrap();

        let packets: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i + 1; 16]).collect();
        let mut wire = Vec::new();
        for packet in &packets {
            wire.extend(enc.encode(packet));
        }
        assert_eq!(wire.len(), 6);

        // Drop the second data shard; the decoder must recover packet 1
        let mut delivered = Vec::new();
        for (i, shard) in wire.iter().enumerate() {
            if i == 1 {
                continue;
            }
            delivered.extend(dec.decode(shard));
        }
        assert!(delivered.contains(&packets[1]), "lost packet not recovered");
        for packet in &packets {
            assert!(delivered.contains(packet));
        }
    }

    #[test]
    fn test_recovers_with_default_shard_counts() {
        let mut enc = FecEncoder::new(10, 3).unwrap();
        let mut dec = FecDecoder::new(10, 3).unwrap();

        let packets: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 50]).collect();
        let mut wire = Vec::new();
        for packet in &packets {
            wire.extend(enc.encode(packet));
        }
        assert_eq!(wire.len(), 13);

        // Lose three data shards, the worst recoverable case
        let mut delivered = Vec::new();
        for (i, shard) in wire.iter().enumerate() {
            if [2, 5, 7].contains(&i) {
                continue;
            }
            delivered.extend(dec.decode(shard));
        }
        for packet in &packets {
            assert!(delivered.contains(packet));
        }
    }

    #[test]
    fn test_short_shard_ignored() {
        let mut dec = FecDecoder::new(4, 2).unwrap();
        assert!(dec.decode(&[0x00, 0x01]).is_empty());
    }
}
