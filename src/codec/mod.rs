// Wire codecs for the serving boundary: self-describing typed arrays (npy)
// and the multi-entry archive response (zip of npy entries).

pub mod archive;
pub mod npy;
