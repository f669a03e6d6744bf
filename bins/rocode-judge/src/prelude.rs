//! Stub runtime prelude injected ahead of user code.
//!
//! Problems on RoCode are written in a Roblox-flavored Luau dialect. The
//! prelude emulates just enough of the engine surface (vector/transform math,
//! input helpers, captured print) that those programs run in a plain
//! interpreter with no engine present. A failure inside this block is a
//! platform defect, never a user error.

/// Marker replaced by the user's source. Lives on its own line so runtime
/// error line numbers stay meaningful relative to the user's code.
const USER_CODE_MARKER: &str = "-- __USER_CODE__";

/// The fixed Luau source concatenated ahead of every submission.
///
/// Conventions:
/// - Engine-visible globals (`Vector3`, `CFrame`, `readline`, ...) are the
///   public surface; everything internal is a `__NAME__` local so the
///   prelude cannot collide with user identifiers.
/// - `Vector3.Unit` is computed lazily through `__index`, cached on the
///   value, and the zero vector's unit is defined as itself - an explicit
///   special case, not generic memoization.
/// - stdin is read whole and pre-split into lines; `readline` and friends
///   are consuming iterators over that buffer.
/// - `print` appends tab-joined, newline-terminated records to a buffer
///   that is flushed to stdout after user code finishes, even when the
///   user code errored part-way through.
pub const LUAU_PRELUDE: &str = r##"-- RoCode judged-program runtime
-- Emulated Roblox-style APIs for algorithm practice. Not the real engine.

Vector3 = {}
Vector3.__index = function(self, key)
  if key == "Unit" then
    if rawget(self, "__unit__") == nil then
      local __mag = self.Magnitude
      if __mag > 0 then
        local __unit = setmetatable({}, Vector3)
        __unit.X = self.X / __mag
        __unit.Y = self.Y / __mag
        __unit.Z = self.Z / __mag
        __unit.Magnitude = 1.0
        rawset(__unit, "__unit__", __unit)
        rawset(self, "__unit__", __unit)
      else
        -- The zero vector's unit is itself.
        rawset(self, "__unit__", self)
      end
    end
    return rawget(self, "__unit__")
  end
  return Vector3[key]
end

function Vector3.new(x, y, z)
  local self = setmetatable({}, Vector3)
  self.X = x or 0
  self.Y = y or 0
  self.Z = z or 0
  self.Magnitude = math.sqrt(self.X ^ 2 + self.Y ^ 2 + self.Z ^ 2)
  return self
end

Vector3.zero = Vector3.new(0, 0, 0)
Vector3.one = Vector3.new(1, 1, 1)
Vector3.xAxis = Vector3.new(1, 0, 0)
Vector3.yAxis = Vector3.new(0, 1, 0)
Vector3.zAxis = Vector3.new(0, 0, 1)

function Vector3:__add(other)
  return Vector3.new(self.X + other.X, self.Y + other.Y, self.Z + other.Z)
end

function Vector3:__sub(other)
  return Vector3.new(self.X - other.X, self.Y - other.Y, self.Z - other.Z)
end

function Vector3:__mul(scalar)
  if type(scalar) == "number" then
    return Vector3.new(self.X * scalar, self.Y * scalar, self.Z * scalar)
  end
  return Vector3.new(self.X * scalar.X, self.Y * scalar.Y, self.Z * scalar.Z)
end

function Vector3:__div(scalar)
  return Vector3.new(self.X / scalar, self.Y / scalar, self.Z / scalar)
end

function Vector3:__eq(other)
  return self.X == other.X and self.Y == other.Y and self.Z == other.Z
end

function Vector3:__tostring()
  return string.format("Vector3(%g, %g, %g)", self.X, self.Y, self.Z)
end

function Vector3:Dot(other)
  return self.X * other.X + self.Y * other.Y + self.Z * other.Z
end

function Vector3:Cross(other)
  return Vector3.new(
    self.Y * other.Z - self.Z * other.Y,
    self.Z * other.X - self.X * other.Z,
    self.X * other.Y - self.Y * other.X
  )
end

function Vector3:Lerp(other, alpha)
  return self + (other - self) * alpha
end

-- Position-only rigid transform.
CFrame = {}
CFrame.__index = CFrame

function CFrame.new(x, y, z)
  local self = setmetatable({}, CFrame)
  if type(x) == "table" and x.X then
    self.Position = x
    self.X = x.X
    self.Y = x.Y
    self.Z = x.Z
  else
    self.X = x or 0
    self.Y = y or 0
    self.Z = z or 0
    self.Position = Vector3.new(self.X, self.Y, self.Z)
  end
  self.LookVector = Vector3.new(0, 0, -1)
  self.RightVector = Vector3.new(1, 0, 0)
  self.UpVector = Vector3.new(0, 1, 0)
  return self
end

CFrame.identity = CFrame.new(0, 0, 0)

function CFrame:__mul(other)
  if type(other) == "table" and other.Position then
    return CFrame.new(self.X + other.X, self.Y + other.Y, self.Z + other.Z)
  elseif type(other) == "table" and other.X then
    return Vector3.new(self.X + other.X, self.Y + other.Y, self.Z + other.Z)
  end
  return self
end

function CFrame:__tostring()
  return string.format("CFrame(%g, %g, %g)", self.X, self.Y, self.Z)
end

function CFrame:Inverse()
  return CFrame.new(-self.X, -self.Y, -self.Z)
end

function CFrame:Lerp(other, alpha)
  return CFrame.new(
    self.X + (other.X - self.X) * alpha,
    self.Y + (other.Y - self.Y) * alpha,
    self.Z + (other.Z - self.Z) * alpha
  )
end

function CFrame.lookAt(pos, target)
  local __cf = CFrame.new(pos.X, pos.Y, pos.Z)
  __cf.LookVector = (target - pos).Unit
  return __cf
end

Color3 = {}
Color3.__index = Color3

function Color3.new(r, g, b)
  local self = setmetatable({}, Color3)
  self.R = r or 0
  self.G = g or 0
  self.B = b or 0
  return self
end

function Color3:__tostring()
  return string.format("Color3(%g, %g, %g)", self.R, self.G, self.B)
end

Vector2 = {}
Vector2.__index = Vector2

function Vector2.new(x, y)
  local self = setmetatable({}, Vector2)
  self.X = x or 0
  self.Y = y or 0
  self.Magnitude = math.sqrt(self.X ^ 2 + self.Y ^ 2)
  return self
end

Vector2.zero = Vector2.new(0, 0)
Vector2.one = Vector2.new(1, 1)

function Vector2:__add(other)
  return Vector2.new(self.X + other.X, self.Y + other.Y)
end

function Vector2:__sub(other)
  return Vector2.new(self.X - other.X, self.Y - other.Y)
end

function Vector2:__mul(scalar)
  if type(scalar) == "number" then
    return Vector2.new(self.X * scalar, self.Y * scalar)
  end
  return Vector2.new(self.X * scalar.X, self.Y * scalar.Y)
end

function Vector2:__tostring()
  return string.format("Vector2(%g, %g)", self.X, self.Y)
end

-- Stdlib extensions problems rely on.
math.clamp = function(value, min, max)
  return math.max(min, math.min(max, value))
end

table.find = function(t, value)
  for __i, __v in ipairs(t) do
    if __v == value then
      return __i
    end
  end
  return nil
end

table.clear = function(t)
  for __k in pairs(t) do
    t[__k] = nil
  end
end

table.freeze = function(t)
  return t
end

table.isfrozen = function(t)
  return false
end

table.clone = function(t)
  local __copy = {}
  for __k, __v in pairs(t) do
    __copy[__k] = __v
  end
  return __copy
end

string.split = function(str, sep)
  local __parts = {}
  for __part in string.gmatch(str, "[^" .. (sep or "%s") .. "]+") do
    table.insert(__parts, __part)
  end
  return __parts
end

-- Scheduling shims. Judged programs run synchronously; waits are no-ops.
function wait(seconds)
  return seconds or 0
end

function delay(seconds, callback)
  callback()
end

task = {
  wait = wait,
  delay = delay,
  spawn = function(callback) callback() end,
  defer = function(callback) callback() end,
}

-- Input helpers: consuming iterators over pre-split stdin lines.
local __INPUT_LINES__ = {}
local __INPUT_INDEX__ = 1

local __STDIN__ = io.read("*a")
if __STDIN__ then
  for __line in string.gmatch(__STDIN__, "[^\r\n]+") do
    table.insert(__INPUT_LINES__, __line)
  end
end

function readline()
  local __line = __INPUT_LINES__[__INPUT_INDEX__]
  __INPUT_INDEX__ = __INPUT_INDEX__ + 1
  return __line
end

function readnumber()
  return tonumber(readline())
end

function readnumbers()
  local __line = readline()
  if not __line then
    return {}
  end
  local __nums = {}
  for __num in string.gmatch(__line, "%S+") do
    table.insert(__nums, tonumber(__num))
  end
  return __nums
end

-- Captured output: each print appends one tab-joined, newline-terminated
-- record; the buffer becomes the process stdout after user code finishes.
local __OUTPUT__ = {}

function print(...)
  local __args = table.pack(...)
  local __parts = {}
  for __i = 1, __args.n do
    table.insert(__parts, tostring(__args[__i]))
  end
  table.insert(__OUTPUT__, table.concat(__parts, "\t") .. "\n")
end

local __OK__, __ERR__ = pcall(function()
-- __USER_CODE__
end)

io.write(table.concat(__OUTPUT__))

if not __OK__ then
  io.stderr:write(tostring(__ERR__))
  os.exit(1)
end
"##;

/// Splice user code into the runtime template.
pub fn compose_program(user_code: &str) -> String {
    LUAU_PRELUDE.replacen(USER_CODE_MARKER, user_code, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_code_lands_after_input_helpers() {
        let program = compose_program("local nums = readnumbers()\nprint(nums[1] + nums[2])");
        let helpers = program.find("function readnumbers").unwrap();
        let user = program.find("nums[1] + nums[2]").unwrap();
        assert!(helpers < user);
    }

    #[test]
    fn marker_is_fully_consumed() {
        let program = compose_program("print(42)");
        assert!(!program.contains(USER_CODE_MARKER));
        assert!(program.contains("print(42)"));
    }

    #[test]
    fn user_code_runs_inside_pcall_before_flush() {
        let program = compose_program("print(1)");
        let pcall = program.find("pcall(function()").unwrap();
        let user = program.find("print(1)").unwrap();
        let flush = program.find("io.write(table.concat(__OUTPUT__))").unwrap();
        assert!(pcall < user);
        assert!(user < flush);
    }

    #[test]
    fn internal_prelude_locals_are_namespaced() {
        // Every `local` declared by the prelude either uses the __NAME__
        // convention or is the conventional `self`/loop-local inside a
        // constructor, so user identifiers cannot collide with it.
        for line in LUAU_PRELUDE.lines() {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("local ") {
                let name: String = rest
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                assert!(
                    name.starts_with("__") || name == "self",
                    "unhygienic prelude local: {name}"
                );
            }
        }
    }
}
