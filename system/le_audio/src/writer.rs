// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Little-endian builder of characteristic values
pub(crate) struct Writer {
    vec: Vec<u8>,
}

impl Writer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self { vec: Vec::with_capacity(capacity) }
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.vec
    }

    pub(crate) fn put(&mut self, slice: &[u8]) {
        self.vec.extend_from_slice(slice);
    }

    pub(crate) fn write_u8(&mut self, v: u8) {
        self.vec.push(v);
    }

    pub(crate) fn write_u16(&mut self, v: u16) {
        self.write_uint::<2>(v.into());
    }

    pub(crate) fn write_u24(&mut self, v: u32) {
        assert!(v <= 0xff_ffff, "Value 0x{:x} does not fit on 24 bits", v);
        self.write_uint::<3>(v);
    }

    pub(crate) fn write_u32(&mut self, v: u32) {
        self.write_uint::<4>(v);
    }

    fn write_uint<const N: usize>(&mut self, mut v: u32) {
        for _ in 0..N {
            self.vec.push((v & 0xff) as u8);
            v >>= 8;
        }
    }

    /// Length-prefixed (one octet) byte string
    pub(crate) fn write_lv(&mut self, data: &[u8]) {
        let len: u8 = data.len().try_into().expect("LV payload longer than 255 octets");
        self.write_u8(len);
        self.put(data);
    }
}

#[test]
fn test_writer_little_endian() {
    let mut w = Writer::with_capacity(16);
    w.write_u8(0x01);
    w.write_u16(0x1234);
    w.write_u24(0x123456);
    w.write_u32(0x01020304);
    w.write_lv(&[0xaa]);
    assert_eq!(
        w.into_vec(),
        [0x01, 0x34, 0x12, 0x56, 0x34, 0x12, 0x04, 0x03, 0x02, 0x01, 0x01, 0xaa]
    );
}
