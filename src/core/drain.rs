// Packet drain loop for synchronous (polled) audio endpoints

use std::fmt::Display;

/// Payload of one captured packet
pub enum PacketData<'a> {
    Samples(&'a [u8]),
    /// The endpoint flagged the packet as silence, its memory must not be read
    Silent,
}

pub struct Packet<'a> {
    pub frames: u32,
    pub data: PacketData<'a>,
}

/// An endpoint that hands out captured packets one at a time.
///
/// Every `acquire` that succeeds must be paired with exactly one `release` of
/// the same frame count before the next packet is requested.
pub trait PacketSource {
    type Error: Display;

    /// Frames in the next pending packet, 0 when the endpoint is empty
    fn next_packet_frames(&mut self) -> Result<u32, Self::Error>;

    fn acquire(&mut self) -> Result<Packet<'_>, Self::Error>;

    fn release(&mut self, frames: u32) -> Result<(), Self::Error>;
}

/// Drain every pending packet into `out`, which is cleared first.
///
/// Silent packets contribute `frames * frame_size` zero bytes. Returns the
/// number of bytes accumulated.
pub fn drain_packets<S: PacketSource>(
    source: &mut S,
    frame_size: usize,
    out: &mut Vec<u8>,
) -> Result<usize, S::Error> {
    out.clear();

    loop {
        if source.next_packet_frames()? == 0 {
            break;
        }

        let frames = {
            let packet = source.acquire()?;
            let bytes = packet.frames as usize * frame_size;
            match packet.data {
                PacketData::Samples(data) => {
                    let take = bytes.min(data.len());
                    out.extend_from_slice(&data[..take]);
                }
                PacketData::Silent => {
                    out.resize(out.len() + bytes, 0);
                }
            }
            packet.frames
        };

        source.release(frames)?;
    }

    Ok(out.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    enum Fake {
        Data(Vec<u8>),
        Silent(u32),
    }

    #[derive(Default)]
    struct FakeEndpoint {
        pending: VecDeque<Fake>,
        current: Option<Fake>,
        frame_size: usize,
        released: Vec<u32>,
        fail_release: bool,
    }

    impl FakeEndpoint {
        fn frames_of(&self, packet: &Fake) -> u32 {
            match packet {
                Fake::Data(bytes) => (bytes.len() / self.frame_size) as u32,
                Fake::Silent(frames) => *frames,
            }
        }
    }

    impl PacketSource for FakeEndpoint {
        type Error = String;

        fn next_packet_frames(&mut self) -> Result<u32, String> {
            Ok(self.pending.front().map(|p| self.frames_of(p)).unwrap_or(0))
        }

        fn acquire(&mut self) -> Result<Packet<'_>, String> {
            if self.current.is_some() {
                return Err("packet acquired twice without release".to_string());
            }
            let packet = self.pending.pop_front().ok_or("no packet")?;
            let frames = self.frames_of(&packet);
            self.current = Some(packet);
            let data = match self.current.as_ref() {
                Some(Fake::Data(bytes)) => PacketData::Samples(bytes),
                _ => PacketData::Silent,
            };
            Ok(Packet { frames, data })
        }

        fn release(&mut self, frames: u32) -> Result<(), String> {
            if self.current.take().is_none() {
                return Err("release without acquire".to_string());
            }
            self.released.push(frames);
            if self.fail_release {
                return Err("device invalidated".to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn test_drains_all_packets_in_order() {
        let mut endpoint = FakeEndpoint {
            frame_size: 4,
            ..Default::default()
        };
        endpoint.pending.push_back(Fake::Data(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        endpoint.pending.push_back(Fake::Data(vec![9, 10, 11, 12]));

        let mut out = vec![0xAA; 3];
        let n = drain_packets(&mut endpoint, 4, &mut out).unwrap();

        assert_eq!(n, 12);
        assert_eq!(out, (1..=12).collect::<Vec<u8>>());
        assert_eq!(endpoint.released, vec![2, 1]);
    }

    #[test]
    fn test_silent_packet_is_zero_filled() {
        let mut endpoint = FakeEndpoint {
            frame_size: 4,
            ..Default::default()
        };
        endpoint.pending.push_back(Fake::Data(vec![7; 4]));
        endpoint.pending.push_back(Fake::Silent(3));

        let mut out = Vec::new();
        drain_packets(&mut endpoint, 4, &mut out).unwrap();

        assert_eq!(out.len(), 4 + 3 * 4);
        assert_eq!(&out[..4], &[7; 4]);
        assert!(out[4..].iter().all(|b| *b == 0));
        assert_eq!(endpoint.released, vec![1, 3]);
    }

    #[test]
    fn test_empty_endpoint_yields_nothing() {
        let mut endpoint = FakeEndpoint {
            frame_size: 4,
            ..Default::default()
        };
        let mut out = vec![1, 2, 3];
        assert_eq!(drain_packets(&mut endpoint, 4, &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_release_error_propagates_after_release() {
        let mut endpoint = FakeEndpoint {
            frame_size: 2,
            fail_release: true,
            ..Default::default()
        };
        endpoint.pending.push_back(Fake::Data(vec![1, 2]));
        endpoint.pending.push_back(Fake::Data(vec![3, 4]));

        let mut out = Vec::new();
        let err = drain_packets(&mut endpoint, 2, &mut out).unwrap_err();
        assert_eq!(err, "device invalidated");
        // The first packet was still released exactly once
        assert_eq!(endpoint.released, vec![1]);
    }
}
