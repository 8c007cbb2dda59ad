//! Names of well-known clients, read from Azureus-style peer ids (`-XXvvvv-...`).

/// the client that generated `peer_id`, if it follows the Azureus convention and is known
pub fn identify(peer_id: &[u8; 20]) -> Option<&'static str> {
    if peer_id[0] != b'-' || peer_id[7] != b'-' {
        return None;
    }
    let name = match &[peer_id[1], peer_id[2]] {
        b"AG" => "Ares",
        b"AR" => "Arctic",
        b"AV" => "Avicora",
        b"AX" => "BitPump",
        b"AZ" => "Azureus",
        b"A~" => "Ares",
        b"BB" => "BitBuddy",
        b"BC" => "BitComet",
        b"BF" => "Bitflu",
        b"BG" => "BTG (uses Rasterbar libtorrent)",
        b"BR" => "BitRocket",
        b"BS" => "BTSlave",
        b"BX" => "~Bittorrent X",
        b"CD" => "Enhanced CTorrent",
        b"CT" => "CTorrent",
        b"DE" => "DelugeTorrent",
        b"DP" => "Propagate Data Client",
        b"EB" => "EBit",
        b"ES" => "electric sheep",
        b"FT" => "FoxTorrent",
        b"FW" => "FrostWire",
        b"FX" => "Freebox BitTorrent",
        b"GS" => "GSTorrent",
        b"HL" => "Halite",
        b"HN" => "Hydranode",
        b"KG" => "KGet",
        b"KT" => "KTorrent",
        b"LH" => "LABC",
        b"LP" => "Lphant",
        b"LT" => "libtorrent",
        b"LW" => "LimeWire",
        b"MO" => "MonoTorrent",
        b"MP" => "MooPolice",
        b"MR" => "Miro",
        b"MT" => "MoonlightTorrent",
        b"NX" => "Net Transport",
        b"PD" => "Pando",
        b"QD" => "QQDownload",
        b"QT" => "Qt 4 Torrent example",
        b"RS" => "swarmlink",
        b"RT" => "Retriever",
        b"SB" => "~Swiftbit",
        b"SS" => "SwarmScope",
        b"ST" => "SymTorrent",
        b"SZ" => "Shareaza",
        b"S~" => "Shareaza alpha/beta",
        b"TN" => "TorrentDotNET",
        b"TR" => "Transmission",
        b"TS" => "Torrentstorm",
        b"TT" => "TuoTu",
        b"UL" => "uLeecher!",
        b"UT" => "µTorrent",
        b"UW" => "µTorrent Web",
        b"VG" => "Vagaa",
        b"WD" => "WebTorrent Desktop",
        b"WT" => "BitLet",
        b"WW" => "WebTorrent",
        b"WY" => "FireTorrent",
        b"XL" => "Xunlei",
        b"XT" => "XanTorrent",
        b"XX" => "Xtorrent",
        b"ZT" => "ZipTorrent",
        b"lt" => "libTorrent",
        b"qB" => "qBittorrent",
        b"st" => "sharktorrent",
        _ => return None,
    };
    Some(name)
}
