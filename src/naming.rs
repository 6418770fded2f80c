//! Friendly name derivation from advertised device names.
//!
//! Robots advertise a short name whose tail is the low 20 bits of their
//! radio MAC in hex, e.g. `HB07A2F`. Those bits index three word pools to
//! produce a stable, human-friendly display name, so the same unit always
//! maps to the same name on every host.

const FIRST_NAMES: [&str; 271] = [
   "Amber", "Atomic", "Autumn", "Azure", "Bashful", "Beaming", "Blazing", "Blissful",
   "Bold", "Bouncy", "Brave", "Breezy", "Bright", "Bubbly", "Bustling", "Buzzing",
   "Calm", "Candid", "Caring", "Cheery", "Chilly", "Chipper", "Chirpy", "Clever",
   "Cloudy", "Comfy", "Cosmic", "Cozy", "Crafty", "Crimson", "Crisp", "Curious",
   "Daring", "Dashing", "Dazzling", "Dreamy", "Drifty", "Dusty", "Eager", "Earnest",
   "Electric", "Elegant", "Emerald", "Epic", "Fancy", "Fearless", "Feisty", "Fierce",
   "Fizzy", "Fluffy", "Flying", "Friendly", "Frosty", "Funky", "Fuzzy", "Gentle",
   "Giddy", "Giggly", "Glad", "Gleaming", "Glowing", "Golden", "Goofy", "Graceful",
   "Grand", "Groovy", "Happy", "Hardy", "Hearty", "Helpful", "Heroic", "Honest",
   "Hopeful", "Humble", "Jaunty", "Jazzy", "Jolly", "Jovial", "Joyful", "Jumpy",
   "Keen", "Kind", "Kindly", "Lively", "Loyal", "Lucky", "Magic", "Mellow",
   "Merry", "Mighty", "Misty", "Modest", "Neat", "Nifty", "Nimble", "Noble",
   "Peachy", "Peppy", "Perky", "Playful", "Plucky", "Polite", "Proud", "Quick",
   "Quiet", "Quirky", "Radiant", "Rainy", "Rapid", "Regal", "Rosy", "Rugged",
   "Rustic", "Sandy", "Sassy", "Shiny", "Silent", "Silky", "Silly", "Sincere",
   "Sleepy", "Slick", "Smiley", "Smooth", "Snappy", "Snazzy", "Snowy", "Snug",
   "Soaring", "Sparkly", "Speedy", "Spiffy", "Spirited", "Spry", "Spunky", "Starry",
   "Steady", "Stellar", "Stormy", "Striped", "Strong", "Sturdy", "Sunny", "Super",
   "Swift", "Swirly", "Thrifty", "Tidy", "Tiny", "Toasty", "Tranquil", "Tricky",
   "True", "Trusty", "Tuneful", "Twinkly", "Upbeat", "Valiant", "Velvet", "Vibrant",
   "Vivid", "Wandering", "Warm", "Whimsical", "Whistling", "Wild", "Windy", "Winged",
   "Wise", "Witty", "Wobbly", "Wondrous", "Zany", "Zealous", "Zesty", "Zippy",
   "Abby", "Ace", "Aiden", "Alfie", "Amos", "Andy", "Annie", "Archie",
   "Artie", "Asher", "Bailey", "Basil", "Bea", "Benny", "Billie", "Birdie",
   "Blake", "Bonnie", "Buddy", "Casey", "Cassie", "Charlie", "Chester", "Cleo",
   "Cody", "Cooper", "Daisy", "Dexter", "Digby", "Dolly", "Dottie", "Duke",
   "Eddie", "Ellie", "Elmo", "Emmy", "Ernie", "Esme", "Felix", "Fergus",
   "Finn", "Fiona", "Fletcher", "Flora", "Frankie", "Freddie", "Gemma", "George",
   "Gilbert", "Goldie", "Gracie", "Gus", "Hank", "Harley", "Harper", "Hattie",
   "Hazel", "Henry", "Herbie", "Holly", "Hugo", "Iggy", "Ivy", "Jack",
   "Jasper", "Jessie", "Joey", "Jojo", "Josie", "Jude", "Juno", "Kit",
   "Koda", "Lenny", "Leo", "Libby", "Lila", "Louie", "Lucy", "Luna",
   "Mabel", "Maggie", "Marley", "Marty", "Max", "Maxie", "Milo", "Minnie",
   "Molly", "Monty", "Morris", "Nell", "Nico", "Noodle", "Nova",
];

const MIDDLE_NAMES: [&str; 79] = [
   "Amber", "Apple", "Apricot", "Aqua", "Ash", "Aspen", "Berry", "Birch",
   "Blossom", "Blue", "Bramble", "Bronze", "Brook", "Cedar", "Cherry", "Cinder",
   "Clay", "Cloud", "Clover", "Cocoa", "Copper", "Coral", "Cotton", "Creek",
   "Crystal", "Dew", "Ember", "Fern", "Flint", "Fog", "Forest", "Garnet",
   "Ginger", "Hazelnut", "Heather", "Holly", "Honey", "Indigo", "Iris", "Ivory",
   "Jade", "Jasmine", "Jet", "Juniper", "Lake", "Lavender", "Leaf", "Lilac",
   "Lime", "Maple", "Marble", "Meadow", "Mint", "Moss", "Night", "Oak",
   "Ocean", "Olive", "Onyx", "Opal", "Orchid", "Pearl", "Pebble", "Pine",
   "Plum", "Prairie", "Quartz", "Rain", "River", "Rose", "Ruby", "Saffron",
   "Sage", "Scarlet", "Sky", "Slate", "Snow", "Stone", "Storm",
];

const LAST_NAMES: [&str; 79] = [
   "Antelope", "Badger", "Bear", "Beaver", "Beetle", "Bison", "Bobcat", "Bunny",
   "Camel", "Cardinal", "Cheetah", "Chickadee", "Chipmunk", "Condor", "Cougar", "Coyote",
   "Crane", "Cricket", "Dolphin", "Donkey", "Dragonfly", "Duckling", "Eagle", "Elephant",
   "Elk", "Falcon", "Ferret", "Finch", "Firefly", "Fox", "Gazelle", "Gecko",
   "Gibbon", "Giraffe", "Gopher", "Gosling", "Grizzly", "Hamster", "Hedgehog", "Heron",
   "Hippo", "Hornet", "Hummingbird", "Ibis", "Iguana", "Jackal", "Jaguar", "Kangaroo",
   "Kestrel", "Kitten", "Koala", "Lemur", "Leopard", "Lion", "Lizard", "Llama",
   "Lynx", "Macaw", "Marmot", "Meerkat", "Mongoose", "Moose", "Narwhal", "Newt",
   "Ocelot", "Octopus", "Osprey", "Otter", "Owl", "Panda", "Panther", "Parrot",
   "Pelican", "Penguin", "Pony", "Puffin", "Quail", "Rabbit", "Raccoon",
];

/// Derives the friendly three-word name from an advertised device name.
///
/// Expects a two-letter type prefix followed by five hex digits (the low 20
/// bits of the MAC). Returns `None` for any other shape; callers fall back
/// to the raw advertised name.
pub fn derive_friendly_name(advertised_name: &str) -> Option<String> {
   if advertised_name.len() != 7 || !advertised_name.is_ascii() {
      return None;
   }

   let mac = u32::from_str_radix(&advertised_name[2..], 16).ok()?;
   let offset = ((mac & 0xFF) % 16) as usize;

   let first = (mac & 0xFF) as usize + offset;
   let middle = ((mac >> 8) & 0x3F) as usize + offset;
   let last = ((mac >> 14) & 0x3F) as usize + offset;

   Some(format!(
      "{} {} {}",
      FIRST_NAMES.get(first)?,
      MIDDLE_NAMES.get(middle)?,
      LAST_NAMES.get(last)?
   ))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_known_derivations() {
      assert_eq!(
         derive_friendly_name("HB07A2F").as_deref(),
         Some("Goofy Scarlet Crane")
      );
      assert_eq!(
         derive_friendly_name("FLABCDE").as_deref(),
         Some("Hugo Sky Lynx")
      );
      assert_eq!(
         derive_friendly_name("HB00000").as_deref(),
         Some("Amber Amber Antelope")
      );
      assert_eq!(
         derive_friendly_name("HBFFFFF").as_deref(),
         Some("Nova Storm Raccoon")
      );
   }

   #[test]
   fn test_prefix_does_not_matter() {
      assert_eq!(
         derive_friendly_name("HB07A2F"),
         derive_friendly_name("MB07A2F")
      );
   }

   #[test]
   fn test_deterministic() {
      let a = derive_friendly_name("HB12345");
      let b = derive_friendly_name("HB12345");
      assert!(a.is_some());
      assert_eq!(a, b);
   }

   #[test]
   fn test_rejects_other_shapes() {
      assert_eq!(derive_friendly_name(""), None);
      assert_eq!(derive_friendly_name("HB07A2"), None);
      assert_eq!(derive_friendly_name("HB07A2F0"), None);
      assert_eq!(derive_friendly_name("HBZZZZZ"), None);
      assert_eq!(derive_friendly_name("Adafruit Bluefruit LE"), None);
      // Multi-byte characters must not slip past the length check.
      assert_eq!(derive_friendly_name("HB07A2\u{e9}"), None);
   }
}
